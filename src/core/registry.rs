//! Call registry and controller table
//!
//! Two lookups resolve the owner of an inbound message: active calls by
//! PLCI, and calls that issued a CONNECT_REQ but have not received their
//! PLCI assignment yet by the request's message number. Both live under
//! one registry lock that is only ever held for the lookup itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::core::call::Line;
use crate::{Error, Result};

#[derive(Default)]
struct RegistryMaps {
    by_plci: HashMap<u32, Arc<Line>>,
    by_msgnum: HashMap<u16, Arc<Line>>,
}

/// PLCI and pending-message-number maps.
#[derive(Default)]
pub struct CallRegistry {
    inner: Mutex<RegistryMaps>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a PLCI to a line. A PLCI may own at most one live record; a
    /// second registration is a protocol violation and is rejected.
    pub fn register_plci(&self, plci: u32, line: Arc<Line>) -> Result<()> {
        if plci == 0 {
            return Err(Error::internal("refusing to register PLCI 0"));
        }
        let mut maps = self.inner.lock();
        if maps.by_plci.contains_key(&plci) {
            return Err(Error::invalid_state(format!(
                "PLCI {:#x} already owned",
                plci
            )));
        }
        maps.by_plci.insert(plci, line);
        Ok(())
    }

    pub fn unregister_plci(&self, plci: u32) {
        if plci != 0 {
            self.inner.lock().by_plci.remove(&plci);
        }
    }

    pub fn find_by_plci(&self, plci: u32) -> Option<Arc<Line>> {
        if plci == 0 {
            return None;
        }
        self.inner.lock().by_plci.get(&plci).cloned()
    }

    /// Track an outbound CONNECT_REQ until its confirmation delivers the
    /// PLCI assignment.
    pub fn register_msgnum(&self, msg_num: u16, line: Arc<Line>) {
        if msg_num == 0 {
            return;
        }
        self.inner.lock().by_msgnum.insert(msg_num, line);
    }

    pub fn take_msgnum(&self, msg_num: u16) -> Option<Arc<Line>> {
        if msg_num == 0 {
            return None;
        }
        self.inner.lock().by_msgnum.remove(&msg_num)
    }

    pub fn unregister_msgnum(&self, msg_num: u16) {
        if msg_num != 0 {
            self.inner.lock().by_msgnum.remove(&msg_num);
        }
    }
}

/// Capabilities and channel occupancy of one adapter port, discovered at
/// startup from the profile and the supported-services query.
#[derive(Debug, Clone, Default)]
pub struct ControllerInfo {
    pub controller: u8,
    pub b_channels: u32,
    pub free_channels: u32,
    pub dtmf: bool,
    pub echo_cancel: bool,
    pub supplementary: bool,
    pub line_interconnect: bool,
    pub hold_retrieve: bool,
    pub terminal_portability: bool,
    pub ect: bool,
    pub three_pty: bool,
    pub call_forwarding: bool,
    pub call_deflection: bool,
    pub mcid: bool,
    pub ccbs: bool,
}

impl ControllerInfo {
    /// Fold the supported-services dword of the supplementary query in.
    pub fn apply_services(&mut self, services: u32) {
        self.hold_retrieve = services & 0x0001 != 0;
        self.terminal_portability = services & 0x0002 != 0;
        self.ect = services & 0x0004 != 0;
        self.three_pty = services & 0x0008 != 0;
        self.call_forwarding = services & 0x0010 != 0;
        self.call_deflection = services & 0x0020 != 0;
        self.mcid = services & 0x0040 != 0;
        self.ccbs = services & 0x0080 != 0;
    }
}

/// Shared controller table with free-channel accounting.
#[derive(Default)]
pub struct ControllerTable {
    inner: Mutex<HashMap<u8, ControllerInfo>>,
}

impl ControllerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ControllerInfo) {
        self.inner.lock().insert(info.controller, info);
    }

    pub fn get(&self, controller: u8) -> Option<ControllerInfo> {
        self.inner.lock().get(&controller).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn update<F: FnOnce(&mut ControllerInfo)>(&self, controller: u8, f: F) {
        if let Some(info) = self.inner.lock().get_mut(&controller) {
            f(info);
        }
    }

    /// Check-and-decrement under the table lock so concurrent line
    /// selections cannot oversubscribe the port.
    pub fn reserve_channel(&self, controller: u8) -> Result<()> {
        let mut table = self.inner.lock();
        let info = table.get_mut(&controller).ok_or_else(|| {
            Error::resource_exhausted(format!("no controller {}", controller))
        })?;
        if info.free_channels == 0 {
            return Err(Error::resource_exhausted(format!(
                "no free B channel on controller {}",
                controller
            )));
        }
        info.free_channels -= 1;
        Ok(())
    }

    pub fn release_channel(&self, controller: u8) {
        let mut table = self.inner.lock();
        if let Some(info) = table.get_mut(&controller) {
            if info.free_channels < info.b_channels {
                info.free_channels += 1;
            } else {
                warn!("controller {}: channel released twice", controller);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ControllerInfo> {
        let mut all: Vec<_> = self.inner.lock().values().cloned().collect();
        all.sort_by_key(|c| c.controller);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LineConfig;
    use crate::media::companding::Law;

    fn line() -> Arc<Line> {
        Arc::new(Line::new(0, LineConfig::named("reg-test"), Law::ALaw))
    }

    #[test]
    fn test_plci_uniqueness_enforced() {
        let reg = CallRegistry::new();
        reg.register_plci(0x101, line()).unwrap();
        let err = reg.register_plci(0x101, line()).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(reg.find_by_plci(0x101).is_some());
        reg.unregister_plci(0x101);
        assert!(reg.find_by_plci(0x101).is_none());
    }

    #[test]
    fn test_msgnum_map_is_take_once() {
        let reg = CallRegistry::new();
        reg.register_msgnum(7, line());
        assert!(reg.take_msgnum(7).is_some());
        assert!(reg.take_msgnum(7).is_none());
        assert!(reg.take_msgnum(0).is_none());
    }

    #[test]
    fn test_channel_reservation_bounds() {
        let table = ControllerTable::new();
        table.insert(ControllerInfo {
            controller: 1,
            b_channels: 2,
            free_channels: 2,
            ..Default::default()
        });
        table.reserve_channel(1).unwrap();
        table.reserve_channel(1).unwrap();
        assert!(matches!(
            table.reserve_channel(1),
            Err(Error::ResourceExhausted(_))
        ));
        table.release_channel(1);
        table.reserve_channel(1).unwrap();
        assert!(matches!(
            table.reserve_channel(99),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_services_dword_mapping() {
        let mut info = ControllerInfo::default();
        info.apply_services(0x0001 | 0x0004 | 0x0040);
        assert!(info.hold_retrieve);
        assert!(info.ect);
        assert!(info.mcid);
        assert!(!info.call_deflection);
    }
}

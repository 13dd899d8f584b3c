//! Message transport boundary
//!
//! The real CAPI adapter (kernel driver or capi20 library) sits behind
//! this trait; the engine only needs register/put/get/release plus the
//! controller profile query performed at startup. `put_message` is not
//! assumed to be thread safe, the engine serializes it behind a
//! dedicated send lock.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::capi::msg::{
    Message, Params, FACILITYSELECTOR_SUPPLEMENTARY,
};
use crate::{Error, Result};

/// Application handle assigned by the adapter at registration.
pub type ApplId = u16;

/// Registration capabilities, mirroring the capi20 register call.
#[derive(Debug, Clone, Copy)]
pub struct RegisterParams {
    pub max_logical_connections: u32,
    pub max_b3_blocks: u32,
    pub max_b3_block_size: u32,
}

/// Static capabilities of one adapter port.
#[derive(Debug, Clone, Copy)]
pub struct ControllerProfile {
    pub b_channels: u32,
    pub dtmf: bool,
    pub echo_cancellation: bool,
    pub supplementary_services: bool,
    pub line_interconnect: bool,
}

impl Default for ControllerProfile {
    fn default() -> Self {
        Self {
            b_channels: 2,
            dtmf: true,
            echo_cancellation: true,
            supplementary_services: true,
            line_interconnect: true,
        }
    }
}

/// The adapter boundary. One registered application handle multiplexes
/// all calls; messages are raw encoded buffers in both directions.
pub trait CapiTransport: Send + Sync {
    fn register(&self, params: &RegisterParams) -> Result<ApplId>;

    fn release(&self, appl_id: ApplId) -> Result<()>;

    /// Write one encoded message. Callers must serialize access.
    fn put_message(&self, appl_id: ApplId, data: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next message; `None` when the queue
    /// stayed empty.
    fn get_message(&self, appl_id: ApplId, timeout: Duration) -> Result<Option<Bytes>>;

    fn controller_count(&self) -> Result<u8>;

    fn profile(&self, controller: u8) -> Result<ControllerProfile>;
}

/// Supplementary services offered by the simulated adapter:
/// HOLD/RETRIEVE, ECT, CD, MCID.
const SIM_SERVICES: u32 = 0x0001 | 0x0004 | 0x0020 | 0x0040;

struct SimInner {
    registered: bool,
    fatal: bool,
    mute: bool,
    auto_data_conf: bool,
    inbox: VecDeque<Bytes>,
    sent: Vec<Message>,
}

/// In-memory adapter used by the tests and the demo binary. It answers
/// the startup handshake (LISTEN, supported-services query) by itself;
/// everything else is recorded for inspection and driven by pushing
/// scripted indications.
pub struct SimulatedTransport {
    controllers: Vec<ControllerProfile>,
    inner: Mutex<SimInner>,
    wakeup: Condvar,
}

impl SimulatedTransport {
    pub fn new(controllers: Vec<ControllerProfile>) -> Self {
        Self {
            controllers,
            inner: Mutex::new(SimInner {
                registered: false,
                fatal: false,
                mute: false,
                auto_data_conf: false,
                inbox: VecDeque::new(),
                sent: Vec::new(),
            }),
            wakeup: Condvar::new(),
        }
    }

    /// One controller with the given number of B channels.
    pub fn single(b_channels: u32) -> Self {
        Self::new(vec![ControllerProfile {
            b_channels,
            ..Default::default()
        }])
    }

    /// Stop producing any replies, including the startup handshake.
    pub fn set_mute(&self, mute: bool) {
        self.inner.lock().mute = mute;
    }

    /// Confirm every DATA_B3_REQ immediately.
    pub fn set_auto_data_conf(&self, on: bool) {
        self.inner.lock().auto_data_conf = on;
    }

    /// Invalidate the application handle; the next poll fails fatally.
    pub fn set_fatal(&self) {
        let mut inner = self.inner.lock();
        inner.fatal = true;
        self.wakeup.notify_all();
    }

    /// Deliver an adapter-originated message to the engine.
    pub fn push(&self, msg: &Message) {
        let mut inner = self.inner.lock();
        inner.inbox.push_back(msg.encode());
        self.wakeup.notify_all();
    }

    /// Deliver a raw (possibly malformed) buffer to the engine.
    pub fn push_raw(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.inbox.push_back(Bytes::copy_from_slice(data));
        self.wakeup.notify_all();
    }

    /// Snapshot of everything the engine sent so far.
    pub fn sent(&self) -> Vec<Message> {
        self.inner.lock().sent.clone()
    }

    /// Block until a sent message matches, with a bounded wait.
    pub fn wait_for_sent<F>(&self, pred: F, timeout: Duration) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            {
                let inner = self.inner.lock();
                if let Some(m) = inner.sent.iter().find(|m| pred(m)) {
                    return Some(m.clone());
                }
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn auto_reply(inner: &mut SimInner, msg: &Message) -> Option<Message> {
        if inner.mute {
            return None;
        }
        match &msg.params {
            Params::ListenReq { .. } => Some(Message::new(
                msg.appl_id,
                msg.msg_num,
                msg.cid,
                Params::ListenConf { info: 0 },
            )),
            Params::FacilityReq { selector, params }
                if *selector == FACILITYSELECTOR_SUPPLEMENTARY
                    && params.len() >= 2
                    && params[0] == 0
                    && params[1] == 0 =>
            {
                // supported-services query: function word, then a struct
                // of supplementary info word + services dword
                let mut content = Vec::new();
                content.extend_from_slice(&0u16.to_le_bytes());
                content.push(6);
                content.extend_from_slice(&0u16.to_le_bytes());
                content.extend_from_slice(&SIM_SERVICES.to_le_bytes());
                Some(Message::new(
                    msg.appl_id,
                    msg.msg_num,
                    msg.cid,
                    Params::FacilityConf {
                        info: 0,
                        selector: FACILITYSELECTOR_SUPPLEMENTARY,
                        params: Bytes::from(content),
                    },
                ))
            }
            Params::DataB3Req { handle, .. } if inner.auto_data_conf => Some(Message::new(
                msg.appl_id,
                msg.msg_num,
                msg.cid,
                Params::DataB3Conf {
                    handle: *handle,
                    info: 0,
                },
            )),
            _ => None,
        }
    }
}

impl CapiTransport for SimulatedTransport {
    fn register(&self, params: &RegisterParams) -> Result<ApplId> {
        trace!(
            "simulated adapter registering (blocks={}, blocksize={})",
            params.max_b3_blocks,
            params.max_b3_block_size
        );
        let mut inner = self.inner.lock();
        inner.registered = true;
        Ok(1)
    }

    fn release(&self, _appl_id: ApplId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.registered = false;
        Ok(())
    }

    fn put_message(&self, _appl_id: ApplId, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fatal {
            return Err(Error::transport_fatal("application handle invalidated"));
        }
        if !inner.registered {
            return Err(Error::transport("not registered"));
        }
        let msg = Message::decode(data)
            .map_err(|e| Error::transport(format!("simulated adapter rejected message: {}", e)))?;
        if let Some(reply) = Self::auto_reply(&mut inner, &msg) {
            inner.inbox.push_back(reply.encode());
        }
        inner.sent.push(msg);
        self.wakeup.notify_all();
        Ok(())
    }

    fn get_message(&self, _appl_id: ApplId, timeout: Duration) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock();
        if inner.fatal {
            return Err(Error::transport_fatal("application handle invalidated"));
        }
        if inner.inbox.is_empty() {
            self.wakeup.wait_for(&mut inner, timeout);
        }
        if inner.fatal {
            return Err(Error::transport_fatal("application handle invalidated"));
        }
        Ok(inner.inbox.pop_front())
    }

    fn controller_count(&self) -> Result<u8> {
        Ok(self.controllers.len() as u8)
    }

    fn profile(&self, controller: u8) -> Result<ControllerProfile> {
        self.controllers
            .get(controller as usize - 1)
            .copied()
            .ok_or_else(|| Error::transport(format!("no controller {}", controller)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_poll_empty() {
        let t = SimulatedTransport::single(2);
        let id = t
            .register(&RegisterParams {
                max_logical_connections: 2,
                max_b3_blocks: 7,
                max_b3_block_size: 160,
            })
            .unwrap();
        assert_eq!(
            t.get_message(id, Duration::from_millis(5)).unwrap(),
            None
        );
    }

    #[test]
    fn test_listen_is_auto_confirmed() {
        let t = SimulatedTransport::single(2);
        let id = t
            .register(&RegisterParams {
                max_logical_connections: 2,
                max_b3_blocks: 7,
                max_b3_block_size: 160,
            })
            .unwrap();
        let req = Message::new(
            id,
            1,
            1,
            Params::ListenReq {
                info_mask: 0xffff,
                cip_mask: 0x1fff03ff,
            },
        );
        t.put_message(id, &req.encode()).unwrap();
        let reply = t
            .get_message(id, Duration::from_millis(5))
            .unwrap()
            .expect("listen conf");
        let reply = Message::decode(&reply).unwrap();
        assert_eq!(reply.params, Params::ListenConf { info: 0 });
    }

    #[test]
    fn test_fatal_poisons_both_directions() {
        let t = SimulatedTransport::single(2);
        let id = t
            .register(&RegisterParams {
                max_logical_connections: 2,
                max_b3_blocks: 7,
                max_b3_block_size: 160,
            })
            .unwrap();
        t.set_fatal();
        assert!(matches!(
            t.get_message(id, Duration::from_millis(1)),
            Err(Error::TransportFatal(_))
        ));
        let req = Message::new(id, 1, 0, Params::AlertReq);
        assert!(matches!(
            t.put_message(id, &req.encode()),
            Err(Error::TransportFatal(_))
        ));
    }
}

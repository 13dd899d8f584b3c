//! Per-call record and its synchronization
//!
//! One `Line` exists per B channel the engine manages. The mutable call
//! state lives behind the line's mutex; the condition variable carries
//! request/confirmation wakeups from the dispatch thread to a caller
//! blocked in `wait_confirmation`.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::capi::msg::{BearerProfile, Command};
use crate::config::LineConfig;
use crate::media::companding::{Gains, Law};
use crate::media::pipeline::VoicePath;
use crate::{Error, Result};

/// Signaling state of a call; exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Disconnected,
    /// Incoming call on an MSN-routed line.
    IncomingCall,
    /// Incoming call collecting DID digits.
    IncomingDid,
    Alerting,
    Answering,
    ConnectPending,
    Connected,
    OnHold,
    Disconnecting,
}

impl CallState {
    /// Short code used by the status display.
    pub fn short(&self) -> &'static str {
        match self {
            CallState::Disconnected => "Disc ",
            CallState::IncomingCall => "icall",
            CallState::IncomingDid => "DIDin",
            CallState::Alerting => "Ring ",
            CallState::Answering => "Answ ",
            CallState::ConnectPending => "Dial ",
            CallState::Connected => "Conn ",
            CallState::OnHold => "Hold ",
            CallState::Disconnecting => "discP",
        }
    }
}

/// Orthogonal per-call condition bits; none of these are exclusive
/// with the signaling state.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsdnFlags {
    pub b3_up: bool,
    pub b3_pending: bool,
    pub b3_changing: bool,
    pub setup_received: bool,
    pub setup_ack_received: bool,
    pub did_digits_received: bool,
    pub progress_sent: bool,
    pub disconnect_received: bool,
    pub hold_active: bool,
    pub ect_active: bool,
    pub interconnect_active: bool,
    pub hangup_queued: bool,
    /// Routing decision made; do not ask the dialplan again.
    pub routed: bool,
    /// Host call object bound to this record.
    pub attached: bool,
    pub rtp_bearer: bool,
    pub echo_cancel_active: bool,
    pub fax_active: bool,
    pub fax_handled: bool,
}

impl IsdnFlags {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Compact flag string for the status display.
    pub fn short(&self) -> String {
        let mut s = String::new();
        if self.attached {
            s.push('*');
        }
        if self.interconnect_active {
            s.push('G');
        }
        if self.b3_up {
            s.push('B');
        }
        if self.b3_pending {
            s.push('b');
        }
        if self.progress_sent {
            s.push('P');
        }
        if self.hold_active {
            s.push('H');
        }
        if self.ect_active {
            s.push('T');
        }
        if self.setup_received || self.setup_ack_received {
            s.push('S');
        }
        s
    }
}

/// Early-B3 mode for outgoing calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EarlyB3 {
    /// Bearer only after connect.
    #[default]
    Never,
    /// Bearer as soon as the call progresses.
    OnSuccess,
    /// Bearer unconditionally, kept through unsuccessful attempts.
    Always,
}

/// Control events delivered to the host call object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Ringing,
    Proceeding,
    Progress,
    Answered,
    Busy,
    Congestion,
    Hangup { cause: u8 },
    FaxTone,
}

/// Frames flowing from the engine to the host call object.
#[derive(Debug, Clone)]
pub enum CallFrame {
    Voice(Bytes),
    Digit(char),
    Control(ControlEvent),
}

/// Mutable per-call state, guarded by the line mutex.
pub struct CallRecord {
    pub plci: u32,
    pub ncci: u32,
    /// Message number of the CONNECT exchange (outgoing REQ awaiting its
    /// CONF, or the CONNECT_IND to answer with a RESP).
    pub msg_num: u16,
    pub state: CallState,
    pub flags: IsdnFlags,
    pub outgoing: bool,
    pub controller: u8,
    pub channel_reserved: bool,
    pub bearer: BearerProfile,
    pub early_b3: EarlyB3,
    /// Confirmation command a caller thread is blocked on, if any.
    pub awaited: Option<Command>,
    pub cip: u16,
    pub cid: String,
    pub cid_ton: u8,
    pub dnid: String,
    pub overlap_digits: String,
    pub cause: u8,
    pub reason: u16,
    pub reason_b3: u16,
    pub held_plci: u32,
    pub echo_cancel: bool,
    pub dtmf_detect: bool,
    pub send_handle: u16,
    pub voice: VoicePath,
    pub sender: Option<mpsc::Sender<CallFrame>>,
}

impl CallRecord {
    fn new(config: &LineConfig, law: Law) -> Self {
        Self {
            plci: 0,
            ncci: 0,
            msg_num: 0,
            state: CallState::Disconnected,
            flags: IsdnFlags::default(),
            outgoing: false,
            controller: 0,
            channel_reserved: false,
            bearer: BearerProfile::Transparent,
            early_b3: EarlyB3::Never,
            awaited: None,
            cip: 0,
            cid: String::new(),
            cid_ton: 0,
            dnid: String::new(),
            overlap_digits: String::new(),
            cause: 0,
            reason: 0,
            reason_b3: 0,
            held_plci: 0,
            echo_cancel: config.echo_cancel,
            dtmf_detect: config.dtmf_detect,
            send_handle: 0,
            voice: VoicePath::new(
                law,
                Gains::new(law, config.rx_gain, config.tx_gain),
                config.echo_squelch,
                config.echo_effective_window,
                config.echo_squelch_ratio,
            ),
            sender: None,
        }
    }

    /// Whether this record currently owns a call (or a pending attempt).
    pub fn in_use(&self) -> bool {
        self.plci != 0
            || self.msg_num != 0
            || self.sender.is_some()
            || self.state != CallState::Disconnected
    }
}

/// One managed B channel: static configuration plus the guarded record.
pub struct Line {
    pub name: String,
    pub index: usize,
    pub config: LineConfig,
    controllers_mask: u32,
    rec: Mutex<CallRecord>,
    confirm: Condvar,
}

impl Line {
    pub fn new(index: usize, config: LineConfig, law: Law) -> Self {
        let mut mask = 0u32;
        for &c in &config.controllers {
            mask |= 1 << c;
        }
        Self {
            name: config.name.clone(),
            index,
            rec: Mutex::new(CallRecord::new(&config, law)),
            confirm: Condvar::new(),
            controllers_mask: mask,
            config,
        }
    }

    pub fn uses_controller(&self, controller: u8) -> bool {
        self.controllers_mask & (1 << controller) != 0
    }

    pub fn controllers_mask(&self) -> u32 {
        self.controllers_mask
    }

    pub fn lock(&self) -> MutexGuard<'_, CallRecord> {
        self.rec.lock()
    }

    /// Block the calling thread until the dispatch loop signals arrival
    /// of the matching confirmation, releasing the call lock while
    /// waiting. The awaited marker is cleared on both outcomes.
    pub fn wait_confirmation(
        &self,
        rec: &mut MutexGuard<'_, CallRecord>,
        command: Command,
        timeout: Duration,
    ) -> Result<()> {
        debug_assert!(rec.awaited.is_none(), "one awaited request per call");
        rec.awaited = Some(command);
        debug!("{}: wait for {}_CONF", self.name, command.name());
        let deadline = Instant::now() + timeout;
        while rec.awaited.is_some() {
            let now = Instant::now();
            if now >= deadline {
                rec.awaited = None;
                return Err(Error::timeout(format!(
                    "{}: timed out waiting for {}_CONF",
                    self.name,
                    command.name()
                )));
            }
            self.confirm.wait_for(rec, deadline - now);
        }
        Ok(())
    }

    /// Dispatch-side counterpart: wake the single waiter when the
    /// arrived command matches the awaited one. Called with the record
    /// locked so a wakeup cannot be lost between check and wait.
    pub fn signal_confirmation(&self, rec: &mut CallRecord, command: Command) -> bool {
        if rec.awaited == Some(command) {
            rec.awaited = None;
            self.confirm.notify_one();
            debug!("{}: found and signaled {}_CONF", self.name, command.name());
            true
        } else {
            false
        }
    }

    /// Hand a frame to the host call object.
    pub fn queue_frame(&self, rec: &mut CallRecord, frame: CallFrame) {
        if !rec.flags.attached {
            // nobody is reading yet, nothing to deliver
            return;
        }
        if rec.state == CallState::Disconnecting || rec.flags.hangup_queued {
            debug!("{}: no queue_frame while disconnecting", self.name);
            return;
        }
        if let CallFrame::Control(ControlEvent::Hangup { .. }) = frame {
            rec.flags.hangup_queued = true;
        }
        match &rec.sender {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    debug!("{}: host side of frame queue is gone", self.name);
                }
            }
            None => error!("{}: no frame queue attached", self.name),
        }
    }

    /// Return the record to the idle pool. The caller is responsible for
    /// registry and controller-channel bookkeeping.
    pub fn cleanup(&self, rec: &mut CallRecord) {
        debug!("{}: interface cleanup PLCI={:#x}", self.name, rec.plci);
        rec.plci = 0;
        rec.ncci = 0;
        rec.msg_num = 0;
        rec.held_plci = 0;
        rec.state = CallState::Disconnected;
        rec.flags.clear();
        rec.awaited = None;
        rec.outgoing = false;
        rec.controller = 0;
        rec.channel_reserved = false;
        rec.bearer = BearerProfile::Transparent;
        rec.early_b3 = EarlyB3::Never;
        rec.cip = 0;
        rec.cid.clear();
        rec.cid_ton = 0;
        rec.dnid.clear();
        rec.overlap_digits.clear();
        rec.cause = 0;
        rec.reason = 0;
        rec.reason_b3 = 0;
        rec.send_handle = 0;
        rec.echo_cancel = self.config.echo_cancel;
        rec.dtmf_detect = self.config.dtmf_detect;
        rec.voice.reset();
        rec.sender = None;
    }

    /// Snapshot for the administrative status query.
    pub fn status(&self) -> LineStatus {
        let rec = self.lock();
        let direction = if !rec.in_use() {
            '-'
        } else if rec.outgoing {
            'O'
        } else {
            'I'
        };
        LineStatus {
            name: self.name.clone(),
            state: rec.state,
            flags: rec.flags.short(),
            direction,
            bearer: rec.bearer,
            caller: rec.cid.clone(),
            called: rec.dnid.clone(),
            caller_ton: rec.cid_ton,
        }
    }
}

/// Per-line state snapshot.
#[derive(Debug, Clone)]
pub struct LineStatus {
    pub name: String,
    pub state: CallState,
    pub flags: String,
    pub direction: char,
    pub bearer: BearerProfile,
    pub caller: String,
    pub called: String,
    pub caller_ton: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LineConfig;

    fn test_line() -> Line {
        Line::new(0, LineConfig::named("test"), Law::ALaw)
    }

    #[test]
    fn test_wait_confirmation_times_out() {
        let line = test_line();
        let mut rec = line.lock();
        let started = Instant::now();
        let err = line
            .wait_confirmation(&mut rec, Command::Connect, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(rec.awaited.is_none(), "marker cleared after timeout");
    }

    #[test]
    fn test_signal_wakes_matching_waiter_only() {
        let line = std::sync::Arc::new(test_line());
        {
            let mut rec = line.lock();
            assert!(!line.signal_confirmation(&mut rec, Command::Connect));
        }
        let waiter = {
            let line = line.clone();
            std::thread::spawn(move || {
                let mut rec = line.lock();
                line.wait_confirmation(&mut rec, Command::Disconnect, Duration::from_secs(2))
            })
        };
        // wait until the waiter is parked on the condvar
        loop {
            let mut rec = line.lock();
            if rec.awaited.is_some() {
                assert!(!line.signal_confirmation(&mut rec, Command::Connect));
                assert!(line.signal_confirmation(&mut rec, Command::Disconnect));
                break;
            }
            drop(rec);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_cleanup_returns_record_to_idle() {
        let line = test_line();
        let (tx, _rx) = std::sync::mpsc::channel();
        {
            let mut rec = line.lock();
            rec.plci = 0x101;
            rec.ncci = 0x10101;
            rec.state = CallState::Connected;
            rec.flags.b3_up = true;
            rec.sender = Some(tx);
            assert!(rec.in_use());
            line.cleanup(&mut rec);
            assert!(!rec.in_use());
            assert_eq!(rec.plci, 0);
            assert_eq!(rec.ncci, 0);
            assert!(!rec.flags.b3_up);
        }
        assert_eq!(line.status().direction, '-');
    }
}

//! The CAPI engine: dispatch loop, state-machine handlers and the
//! host-facing call operations
//!
//! LOCKING RULES
//! =============
//!
//! Several locks exist and must only be acquired in this order:
//!
//!   1. the per-line call record lock
//!   2. the call registry lock (PLCI / message-number maps)
//!   3. the controller table lock
//!   4. the transport send lock
//!
//! The registry and controller locks are held for single lookups only,
//! never across a blocking wait. `wait_confirmation` releases the call
//! record lock while the caller thread is parked.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::capi::facility::{self, SupplementaryConf, SupplementaryInd};
use crate::capi::msg::{
    BProtocol, BearerProfile, CalledNumber, CallingNumber, Command, ConnectedNumber, Kind, Message,
    Params, FACILITYSELECTOR_DTMF, FACILITYSELECTOR_LINE_INTERCONNECT,
    FACILITYSELECTOR_SUPPLEMENTARY, REJECT_ACCEPT, REJECT_IGNORE, REJECT_NORMAL_CLEARING,
};
use crate::capi::transport::{ApplId, CapiTransport, RegisterParams};
use crate::config::{CapiConfig, IsdnMode};
use crate::core::call::{
    CallFrame, CallRecord, CallState, ControlEvent, EarlyB3, Line, LineStatus,
};
use crate::core::registry::{CallRegistry, ControllerInfo, ControllerTable};
use crate::media::companding::Law;
use crate::media::pipeline::{B3_BLOCK_SIZE, B3_BLOCK_WINDOW};
use crate::{Error, Result};

/// Logical connections requested at registration.
const REGISTER_MAX_CONNECTIONS: u32 = 120;

/// Q.850 causes the engine interprets.
const CAUSE_NORMAL_CLEARING: u8 = 16;
const CAUSE_USER_BUSY: u8 = 17;
const CAUSE_NO_USER_RESPONSE: u8 = 18;
const CAUSE_NO_ANSWER: u8 = 19;
const CAUSE_CIRCUIT_CONGESTION: u8 = 34;

/// Q.931 information element numbers seen in INFO_IND.
const IE_CAUSE: u16 = 0x0008;
const IE_CALL_STATE: u16 = 0x0014;
const IE_CHANNEL_ID: u16 = 0x0018;
const IE_PROGRESS_INDICATOR: u16 = 0x001e;
const IE_CALLED_PARTY_NUMBER: u16 = 0x0070;
const IE_REDIRECTING_NUMBER: u16 = 0x0074;
const IE_SENDING_COMPLETE: u16 = 0x00a1;
const IE_MSG_ALERTING: u16 = 0x8001;
const IE_MSG_CALL_PROCEEDING: u16 = 0x8002;
const IE_MSG_PROGRESS: u16 = 0x8003;
const IE_MSG_SETUP: u16 = 0x8005;
const IE_MSG_SETUP_ACK: u16 = 0x800d;
const IE_MSG_DISCONNECT: u16 = 0x8045;

/// Caller-number type-of-number bits.
const TON_MASK: u8 = 0x70;
const TON_INTERNATIONAL: u8 = 0x10;
const TON_NATIONAL: u8 = 0x20;

/// Selector for a line to dial out on.
#[derive(Debug, Clone)]
pub enum LineSelector {
    Name(String),
    Controller(u8),
    Group(u32),
}

/// Options of an outgoing call.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub early_b3: EarlyB3,
    /// Send digits via overlap dialing after SETUP_ACK.
    pub overlap: bool,
    pub caller_id: Option<String>,
    pub caller_ton: u8,
    pub presentation: u8,
}

/// Decision of the host dialplan about an incoming destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Accept,
    /// More digits could still produce a match (overlap receiving).
    Possible,
    Reject,
}

/// Host dialplan boundary: decides whether an incoming destination is
/// served. The engine only consumes the decision.
pub trait CallRouter: Send + Sync {
    fn route(&self, line: &str, digits: &str, immediate: bool) -> RouteDecision;
}

/// Default router accepting every call.
pub struct AcceptAll;

impl CallRouter for AcceptAll {
    fn route(&self, _line: &str, _digits: &str, _immediate: bool) -> RouteDecision {
        RouteDecision::Accept
    }
}

/// Host-side handle of one call: the line plus the frame queue end.
pub struct CallHandle {
    pub line: Arc<Line>,
    pub frames: mpsc::Receiver<CallFrame>,
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("line", &self.line.name)
            .finish_non_exhaustive()
    }
}

/// Notification of an accepted incoming call.
pub struct IncomingCall {
    pub handle: CallHandle,
    pub caller: String,
    pub called: String,
}

/// Work queued by handlers for execution outside any call lock.
enum Deferred {
    Teardown(Arc<Line>),
    SoftHangup(Arc<Line>, ControlEvent),
}

/// The protocol engine. One instance per registered application.
pub struct CapiEngine {
    transport: Arc<dyn CapiTransport>,
    appl_id: ApplId,
    national_prefix: String,
    international_prefix: String,
    poll_timeout: Duration,
    confirmation_timeout: Duration,
    info_mask: u32,
    cip_mask: u32,
    put_lock: Mutex<()>,
    msg_counter: AtomicU16,
    registry: CallRegistry,
    controllers: ControllerTable,
    lines: Vec<Arc<Line>>,
    router: Box<dyn CallRouter>,
    deferred: Mutex<VecDeque<Deferred>>,
    incoming_tx: Mutex<mpsc::Sender<IncomingCall>>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingCall>>>,
    running: AtomicBool,
    failed: AtomicBool,
    debug_dump: AtomicBool,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl CapiEngine {
    pub fn new(transport: Arc<dyn CapiTransport>, config: &CapiConfig) -> Result<Arc<Self>> {
        Self::with_router(transport, config, Box::new(AcceptAll))
    }

    pub fn with_router(
        transport: Arc<dyn CapiTransport>,
        config: &CapiConfig,
        router: Box<dyn CallRouter>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let law: Law = config.general.law.into();

        let appl_id = transport.register(&RegisterParams {
            max_logical_connections: REGISTER_MAX_CONNECTIONS,
            max_b3_blocks: B3_BLOCK_WINDOW as u32,
            max_b3_block_size: B3_BLOCK_SIZE as u32,
        })?;
        info!(
            "registered at CAPI (appl_id={}, blocksize={})",
            appl_id, B3_BLOCK_SIZE
        );

        let mut lines = Vec::new();
        for line_config in &config.lines {
            for _ in 0..line_config.devices {
                lines.push(Arc::new(Line::new(
                    lines.len(),
                    line_config.clone(),
                    law,
                )));
            }
        }

        let (incoming_tx, incoming_rx) = mpsc::channel();
        let engine = Arc::new(Self {
            transport,
            appl_id,
            national_prefix: config.general.national_prefix.clone(),
            international_prefix: config.general.international_prefix.clone(),
            poll_timeout: Duration::from_millis(config.engine.poll_interval_ms),
            confirmation_timeout: Duration::from_millis(config.engine.confirmation_timeout_ms),
            info_mask: config.engine.info_mask,
            cip_mask: config.engine.cip_mask,
            put_lock: Mutex::new(()),
            msg_counter: AtomicU16::new(0),
            registry: CallRegistry::new(),
            controllers: ControllerTable::new(),
            lines,
            router,
            deferred: Mutex::new(VecDeque::new()),
            incoming_tx: Mutex::new(incoming_tx),
            incoming_rx: Mutex::new(Some(incoming_rx)),
            running: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            debug_dump: AtomicBool::new(false),
            dispatch: Mutex::new(None),
        });

        engine.discover_controllers()?;
        engine.listen_on_used_controllers();
        Ok(engine)
    }

    /// Receiver of incoming-call notifications; can be taken once.
    pub fn take_incoming_receiver(&self) -> Option<mpsc::Receiver<IncomingCall>> {
        self.incoming_rx.lock().take()
    }

    /// Start the dispatch thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state("engine already running"));
        }
        let engine = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("capi-dispatch".into())
            .spawn(move || engine.run())?;
        *self.dispatch.lock() = Some(handle);
        info!("CAPI engine started ({} lines)", self.lines.len());
        Ok(())
    }

    /// Stop the dispatch thread and release the application handle.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.dispatch.lock().take() {
            let _ = handle.join();
        }
        if let Err(e) = self.transport.release(self.appl_id) {
            warn!("release failed: {}", e);
        }
        info!("CAPI engine stopped");
    }

    /// The engine hit the fatal transport error and must be recreated.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Toggle verbose protocol dumps.
    pub fn set_debug(&self, on: bool) {
        self.debug_dump.store(on, Ordering::Relaxed);
    }

    /// Per-line state snapshot for the administrative surface.
    pub fn line_status(&self) -> Vec<LineStatus> {
        self.lines.iter().map(|l| l.status()).collect()
    }

    /// Channel occupancy per controller.
    pub fn controller_status(&self) -> Vec<ControllerInfo> {
        self.controllers.snapshot()
    }

    // ------------------------------------------------------------------
    // startup
    // ------------------------------------------------------------------

    fn discover_controllers(&self) -> Result<()> {
        let count = self.transport.controller_count()?;
        info!("this box has {} CAPI controller(s)", count);
        for controller in 1..=count {
            let profile = self.transport.profile(controller)?;
            let mut cinfo = ControllerInfo {
                controller,
                b_channels: profile.b_channels,
                free_channels: profile.b_channels,
                dtmf: profile.dtmf,
                echo_cancel: profile.echo_cancellation,
                supplementary: profile.supplementary_services,
                line_interconnect: profile.line_interconnect,
                ..Default::default()
            };
            if cinfo.dtmf {
                debug!("contr{} supports DTMF", controller);
            }
            if cinfo.echo_cancel {
                debug!("contr{} supports echo cancellation", controller);
            }
            if cinfo.supplementary {
                self.query_supplementary(controller, &mut cinfo);
            }
            self.controllers.insert(cinfo);
        }
        Ok(())
    }

    /// Ask one controller for its supplementary services, consuming the
    /// confirmation synchronously; the dispatch loop is not running yet.
    fn query_supplementary(&self, controller: u8, cinfo: &mut ControllerInfo) {
        let msg = Message::new(
            self.appl_id,
            self.next_msg_num(),
            controller as u32,
            Params::FacilityReq {
                selector: FACILITYSELECTOR_SUPPLEMENTARY,
                params: facility::supplementary_simple(facility::SUPPL_GET_SUPPORTED),
            },
        );
        if let Err(e) = self.put(&msg) {
            warn!("contr{}: supplementary query failed: {}", controller, e);
            return;
        }
        match self.wait_startup_message(|m| {
            matches!(m.params, Params::FacilityConf { selector, .. }
                if selector == FACILITYSELECTOR_SUPPLEMENTARY)
        }) {
            Ok(conf) => {
                if let Params::FacilityConf { params, .. } = &conf.params {
                    match facility::parse_supplementary_conf(params) {
                        Ok(SupplementaryConf {
                            services: Some(services),
                            ..
                        }) => {
                            debug!("contr{}: supplementary services {:#010x}", controller, services);
                            cinfo.apply_services(services);
                        }
                        Ok(_) => warn!("contr{}: services dword missing", controller),
                        Err(e) => warn!("contr{}: bad services confirmation: {}", controller, e),
                    }
                }
            }
            Err(e) => warn!("contr{}: no supplementary confirmation: {}", controller, e),
        }
    }

    fn listen_on_used_controllers(&self) {
        let mut used = 0u32;
        for line in &self.lines {
            used |= line.controllers_mask();
        }
        for controller in 1..=30u8 {
            if used & (1 << controller) == 0 {
                continue;
            }
            if self.controllers.get(controller).is_none() {
                warn!("contr{} configured but not present", controller);
                continue;
            }
            let msg = Message::new(
                self.appl_id,
                self.next_msg_num(),
                controller as u32,
                Params::ListenReq {
                    info_mask: self.info_mask,
                    cip_mask: self.cip_mask,
                },
            );
            if let Err(e) = self.put(&msg) {
                error!("unable to listen on contr{}: {}", controller, e);
                continue;
            }
            match self.wait_startup_message(|m| {
                matches!(m.params, Params::ListenConf { .. })
            }) {
                Ok(conf) => {
                    if let Params::ListenConf { info } = conf.params {
                        if info != 0 {
                            error!("listen on contr{} rejected ({:#06x})", controller, info);
                        } else {
                            info!(
                                "listening on contr{} (CIP mask {:#x})",
                                controller, self.cip_mask
                            );
                        }
                    }
                }
                Err(e) => error!("no LISTEN_CONF from contr{}: {}", controller, e),
            }
        }
    }

    /// Bounded synchronous poll used during startup, before the
    /// dispatch thread exists. Unrelated messages are discarded.
    fn wait_startup_message<F: Fn(&Message) -> bool>(&self, pred: F) -> Result<Message> {
        for _ in 0..100 {
            if let Some(buf) = self
                .transport
                .get_message(self.appl_id, Duration::from_millis(20))?
            {
                match Message::decode(&buf) {
                    Ok(m) if pred(&m) => return Ok(m),
                    Ok(m) => debug!("startup: discarding {}", m.label()),
                    Err(e) => warn!("startup: dropping malformed message: {}", e),
                }
            }
        }
        Err(Error::timeout("startup confirmation"))
    }

    // ------------------------------------------------------------------
    // message plumbing
    // ------------------------------------------------------------------

    /// Monotonic message number, never zero.
    fn next_msg_num(&self) -> u16 {
        loop {
            let n = self.msg_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if n != 0 {
                return n;
            }
        }
    }

    /// Serialize and write one message behind the exclusive send lock.
    fn put(&self, msg: &Message) -> Result<()> {
        {
            let _guard = self.put_lock.lock();
            self.transport.put_message(self.appl_id, &msg.encode())?;
        }
        if msg.command() == Command::DataB3 {
            trace!("sent {} CID={:#x}", msg.label(), msg.cid);
        } else {
            debug!("sent {} CID={:#x}", msg.label(), msg.cid);
        }
        Ok(())
    }

    /// Fire-and-forget send; failures are logged like every other
    /// per-call fault and contained to this call.
    fn send(&self, msg: Message) {
        if let Err(e) = self.put(&msg) {
            error!("error sending {} (CID={:#x}): {}", msg.label(), msg.cid, e);
        }
    }

    /// Send a request and block the calling thread on the line condvar
    /// until the matching confirmation arrives or the timeout elapses.
    fn send_request_and_wait(
        &self,
        line: &Line,
        rec: &mut MutexGuard<'_, CallRecord>,
        cid: u32,
        params: Params,
    ) -> Result<()> {
        let command = params.command();
        let msg = Message::new(self.appl_id, self.next_msg_num(), cid, params);
        self.put(&msg)?;
        line.wait_confirmation(rec, command, self.confirmation_timeout)
    }

    // ------------------------------------------------------------------
    // dispatch loop
    // ------------------------------------------------------------------

    fn run(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            match self.transport.get_message(self.appl_id, self.poll_timeout) {
                Ok(Some(buf)) => {
                    self.handle_buffer(&buf);
                    self.drain_deferred();
                }
                Ok(None) => continue,
                Err(e) if e.is_fatal() => {
                    error!("CAPI reports application handle invalid, engine halted: {}", e);
                    self.failed.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    warn!("error waiting for message: {}", e);
                }
            }
        }
    }

    fn handle_buffer(&self, buf: &[u8]) {
        let msg = match Message::decode(buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed message: {}", e);
                return;
            }
        };
        self.handle_message(msg);
    }

    fn handle_message(&self, msg: Message) {
        let plci = msg.plci();
        if msg.command() == Command::DataB3 && !self.debug_dump.load(Ordering::Relaxed) {
            trace!("received {} CID={:#x}", msg.label(), msg.cid);
        } else {
            debug!("received {} CID={:#x}", msg.label(), msg.cid);
        }

        // CONNECT_IND allocates a record; CONNECT_CONF resolves by the
        // pending message number. Everything else resolves by PLCI.
        match &msg.params {
            Params::ConnectInd { .. } => {
                self.handle_connect_ind(&msg);
                return;
            }
            Params::ConnectConf { info } => {
                self.handle_connect_conf(&msg, *info);
                return;
            }
            _ => {}
        }

        if let Some(resp) = self.immediate_response(&msg) {
            self.send(resp);
        }

        let line = match self.registry.find_by_plci(plci) {
            Some(line) => line,
            None => {
                debug!(
                    "{}: no interface for PLCI={:#x}, MSGNUM={:#x}",
                    msg.label(),
                    plci,
                    msg.msg_num
                );
                return;
            }
        };

        let mut rec = line.lock();
        match msg.params.clone() {
            Params::DataB3Ind { data, .. } => self.on_data_b3_ind(&line, &mut rec, data),
            Params::ConnectB3Ind { .. } => self.on_connect_b3_ind(&mut rec, msg.cid),
            Params::ConnectB3ActiveInd { .. } => self.on_connect_b3_active_ind(&line, &mut rec),
            Params::DisconnectB3Ind { reason_b3, ncpi } => {
                self.on_disconnect_b3_ind(&line, &mut rec, reason_b3, ncpi)
            }
            Params::DisconnectInd { reason } => self.on_disconnect_ind(&line, &mut rec, reason),
            Params::FacilityInd { selector, params } => {
                self.on_facility_ind(&line, &mut rec, selector, &params)
            }
            Params::InfoInd {
                info_number,
                element,
            } => self.on_info_ind(&line, &mut rec, info_number, &element),
            Params::ConnectActiveInd { .. } => self.on_connect_active_ind(&line, &mut rec),

            Params::FacilityConf {
                info,
                selector,
                params,
            } => self.on_facility_conf(&line, &mut rec, info, selector, &params),
            Params::ConnectB3Conf { info } => {
                self.conf_result(&line, &rec, Command::ConnectB3, info);
                if info == 0 {
                    rec.ncci = msg.cid;
                } else {
                    rec.flags.b3_up = false;
                    rec.flags.b3_pending = false;
                }
            }
            Params::AlertConf { info } => {
                // alert already sent by another application is not an error
                if info != 0x0003 {
                    self.conf_result(&line, &rec, Command::Alert, info);
                }
                if info & 0xff00 == 0 && rec.state != CallState::Disconnecting {
                    rec.state = CallState::Alerting;
                }
            }
            Params::SelectBProtocolConf { info } => {
                self.conf_result(&line, &rec, Command::SelectBProtocol, info);
                if info == 0 && rec.flags.fax_active {
                    self.echo_canceller(&line, &mut rec, false);
                    self.dtmf_listen(&line, &mut rec, false);
                }
            }
            Params::DataB3Conf { info, .. } => {
                if info != 0 {
                    self.conf_result(&line, &rec, Command::DataB3, info);
                }
                rec.voice.flow.replenish();
            }
            Params::DisconnectConf { info } => self.conf_result(&line, &rec, Command::Disconnect, info),
            Params::DisconnectB3Conf { info } => {
                self.conf_result(&line, &rec, Command::DisconnectB3, info)
            }
            Params::ListenConf { info } => self.conf_result(&line, &rec, Command::Listen, info),
            Params::InfoConf { info } => self.conf_result(&line, &rec, Command::Info, info),
            other => {
                debug!("{}: unhandled {}", line.name, Message::new(0, 0, 0, other).label());
            }
        }

        // wake a blocked caller thread when its confirmation arrived
        if msg.kind() == Kind::Confirmation {
            line.signal_confirmation(&mut rec, msg.command());
        }
    }

    /// Protocol-mandated acknowledgement for an indication, sent before
    /// any state handling (and even without an owning call record).
    fn immediate_response(&self, msg: &Message) -> Option<Message> {
        let params = match &msg.params {
            Params::ConnectActiveInd { .. } => Params::ConnectActiveResp,
            Params::ConnectB3Ind { .. } => Params::ConnectB3Resp {
                reject: REJECT_ACCEPT,
                ncpi: None,
            },
            Params::ConnectB3ActiveInd { .. } => Params::ConnectB3ActiveResp,
            Params::DisconnectB3Ind { .. } => Params::DisconnectB3Resp,
            Params::DisconnectInd { .. } => Params::DisconnectResp,
            Params::InfoInd { .. } => Params::InfoResp,
            Params::FacilityInd { selector, params } => Params::FacilityResp {
                selector: *selector,
                params: params.clone(),
            },
            // the receive acknowledgement frees the adapter buffer, so
            // it goes out before any voice processing
            Params::DataB3Ind { handle, .. } => Params::DataB3Resp { handle: *handle },
            _ => return None,
        };
        Some(Message::new(self.appl_id, msg.msg_num, msg.cid, params))
    }

    fn conf_result(&self, line: &Line, _rec: &CallRecord, command: Command, info: u16) {
        if info == 0 {
            return;
        }
        if info == 0x2002 {
            debug!(
                "{}: {:#06x} (wrong state) for {}_CONF",
                line.name,
                info,
                command.name()
            );
        } else {
            warn!(
                "{}: confirmation error {:#06x} for {}_CONF",
                line.name,
                info,
                command.name()
            );
        }
    }

    fn drain_deferred(&self) {
        loop {
            let action = self.deferred.lock().pop_front();
            match action {
                Some(Deferred::Teardown(line)) => {
                    let mut rec = line.lock();
                    self.cleanup_line(&line, &mut rec);
                }
                Some(Deferred::SoftHangup(line, event)) => {
                    let mut rec = line.lock();
                    line.queue_frame(&mut rec, CallFrame::Control(event));
                }
                None => break,
            }
        }
    }

    fn defer(&self, action: Deferred) {
        self.deferred.lock().push_back(action);
    }

    /// Release everything the call owned and return the line to idle.
    fn cleanup_line(&self, line: &Line, rec: &mut CallRecord) {
        self.registry.unregister_plci(rec.plci);
        if rec.outgoing {
            // an incoming call's message number belongs to the adapter's
            // counter and must not touch the pending-dial map
            self.registry.unregister_msgnum(rec.msg_num);
        }
        if rec.channel_reserved {
            self.controllers.release_channel(rec.controller);
        }
        line.cleanup(rec);
    }

    // ------------------------------------------------------------------
    // indication handlers
    // ------------------------------------------------------------------

    fn handle_connect_ind(&self, msg: &Message) {
        let (cip, called, calling, bchannel_info) = match &msg.params {
            Params::ConnectInd {
                cip,
                called,
                calling,
                bchannel_info,
                ..
            } => (*cip, called, calling, bchannel_info),
            _ => return,
        };
        let plci = msg.plci();
        if self.registry.find_by_plci(plci).is_some() {
            // double connect indications are not supported
            debug!("CONNECT_IND for already owned PLCI={:#x} ignored", plci);
            return;
        }

        let controller = (plci & 0xff) as u8;
        let dnid = called.as_ref().map(|n| n.digits.clone()).unwrap_or_default();
        let (caller_digits, caller_plan) = match calling {
            Some(n) => (n.digits.clone(), n.plan),
            None => (String::new(), 0),
        };
        info!(
            "CONNECT_IND (PLCI={:#x}, DID={}, CID={}, CIP={:#x}, controller={})",
            plci, dnid, caller_digits, cip, controller
        );

        // only bearer-channel calls are handled here
        if let Some(info) = bchannel_info {
            if info.first().copied().unwrap_or(0) != 0 {
                debug!("ignoring call without B channel (PLCI={:#x})", plci);
                return;
            }
        }

        for line in &self.lines {
            if !line.uses_controller(controller) {
                continue;
            }
            let mut rec = line.lock();
            if rec.in_use() {
                continue;
            }
            let stored = match self.match_msn(line, &dnid) {
                Some(stored) => stored,
                None => continue,
            };

            if let Err(e) = self.controllers.reserve_channel(controller) {
                warn!("{}: cannot take call: {}", line.name, e);
                break;
            }
            rec.channel_reserved = true;
            rec.controller = controller;
            rec.plci = plci;
            rec.msg_num = msg.msg_num;
            rec.cip = cip;
            rec.cid_ton = caller_plan;
            rec.dnid = stored;
            rec.cid = self.apply_caller_prefixes(line, &caller_digits, caller_plan);
            rec.outgoing = false;
            rec.bearer = BearerProfile::Transparent;
            rec.state = match line.config.isdn_mode {
                IsdnMode::Did => CallState::IncomingDid,
                IsdnMode::Msn => CallState::IncomingCall,
            };
            if let Err(e) = self.registry.register_plci(plci, Arc::clone(line)) {
                warn!("{}: {}", line.name, e);
                self.cleanup_line(line, &mut rec);
                break;
            }
            info!(
                "{}: incoming call '{}' -> '{}'",
                line.name, rec.cid, rec.dnid
            );

            if line.config.isdn_mode == IsdnMode::Msn && line.config.immediate {
                // route now instead of waiting for SETUP / sending complete
                self.start_call_on_match(line, &mut rec);
            }
            return;
        }

        debug!("no matching idle line for called number '{}'", dnid);
        self.send(Message::new(
            self.appl_id,
            msg.msg_num,
            msg.cid,
            Params::ConnectResp {
                reject: REJECT_IGNORE,
                connected: None,
                b_protocol: None,
            },
        ));
    }

    /// MSN matching. Returns the destination to store: in DID mode the
    /// matched prefix is stripped, everything else keeps the number.
    fn match_msn(&self, line: &Line, dnid: &str) -> Option<String> {
        let did_mode = line.config.isdn_mode == IsdnMode::Did;
        for msn in line.config.msn_list() {
            let wildcard = msn == "*";
            if dnid.is_empty() {
                if wildcard {
                    return Some(String::new());
                }
                continue;
            }
            if wildcard {
                return Some(dnid.to_string());
            }
            if msn.eq_ignore_ascii_case(dnid) {
                return Some(if did_mode {
                    String::new()
                } else {
                    dnid.to_string()
                });
            }
            if did_mode
                && msn.len() < dnid.len()
                && dnid[..msn.len()].eq_ignore_ascii_case(msn)
            {
                return Some(dnid[msn.len()..].to_string());
            }
        }
        None
    }

    fn apply_caller_prefixes(&self, line: &Line, digits: &str, plan: u8) -> String {
        if digits.is_empty() {
            return String::new();
        }
        let national = match plan & TON_MASK {
            TON_NATIONAL => self.national_prefix.as_str(),
            TON_INTERNATIONAL => self.international_prefix.as_str(),
            _ => "",
        };
        format!("{}{}{}", line.config.prefix, national, digits)
    }

    /// Ask the host dialplan about the collected destination and either
    /// attach the call, wait for more digits, or ignore it.
    fn start_call_on_match(&self, line: &Arc<Line>, rec: &mut CallRecord) {
        if rec.flags.routed {
            debug!("{}: call already routed", line.name);
            return;
        }
        let decision = self
            .router
            .route(&line.name, &rec.dnid, line.config.immediate);
        match decision {
            RouteDecision::Accept => {
                rec.flags.routed = true;
                rec.flags.attached = true;
                let (tx, rx) = mpsc::channel();
                rec.sender = Some(tx);
                let notification = IncomingCall {
                    handle: CallHandle {
                        line: Arc::clone(line),
                        frames: rx,
                    },
                    caller: rec.cid.clone(),
                    called: rec.dnid.clone(),
                };
                if self.incoming_tx.lock().send(notification).is_err() {
                    warn!("{}: nobody consumes incoming calls", line.name);
                    self.defer(Deferred::Teardown(Arc::clone(line)));
                }
            }
            RouteDecision::Possible if line.config.isdn_mode == IsdnMode::Did => {
                // more DID digits may still arrive
            }
            _ => {
                rec.flags.routed = true;
                info!(
                    "{}: no destination for '{}', ignoring call",
                    line.name, rec.dnid
                );
                self.send(Message::new(
                    self.appl_id,
                    rec.msg_num,
                    rec.plci,
                    Params::ConnectResp {
                        reject: REJECT_IGNORE,
                        connected: None,
                        b_protocol: None,
                    },
                ));
            }
        }
    }

    fn handle_connect_conf(&self, msg: &Message, info: u16) {
        let line = match self.registry.take_msgnum(msg.msg_num) {
            Some(line) => line,
            None => {
                debug!(
                    "CONNECT_CONF without pending request (MSGNUM={:#x})",
                    msg.msg_num
                );
                return;
            }
        };
        let mut rec = line.lock();
        debug!("{}: received CONNECT_CONF PLCI={:#x}", line.name, msg.plci());
        if info == 0 {
            rec.plci = msg.plci();
            if let Err(e) = self.registry.register_plci(rec.plci, Arc::clone(&line)) {
                error!("{}: {}", line.name, e);
            }
        } else {
            self.conf_result(&line, &rec, Command::Connect, info);
            // the attempt is dead before a PLCI existed
            rec.state = CallState::Disconnected;
            line.queue_frame(&mut rec, CallFrame::Control(ControlEvent::Busy));
        }
        line.signal_confirmation(&mut rec, Command::Connect);
    }

    fn on_connect_active_ind(&self, line: &Arc<Line>, rec: &mut CallRecord) {
        if rec.state == CallState::Disconnecting {
            debug!("{}: CONNECT_ACTIVE while disconnecting", line.name);
            return;
        }
        rec.state = CallState::Connected;

        if rec.flags.fax_active {
            self.signal_answer(line, rec);
            return;
        }
        if !rec.flags.b3_up {
            if rec.outgoing {
                self.start_b3(rec);
            }
            // incoming: the response is out, CONNECT_B3_IND follows
        } else {
            self.signal_answer(line, rec);
        }
    }

    fn signal_answer(&self, line: &Arc<Line>, rec: &mut CallRecord) {
        if rec.outgoing {
            line.queue_frame(rec, CallFrame::Control(ControlEvent::Answered));
        }
    }

    fn start_b3(&self, rec: &mut CallRecord) {
        if rec.flags.b3_up || rec.flags.b3_pending {
            return;
        }
        rec.flags.b3_pending = true;
        self.send(Message::new(
            self.appl_id,
            self.next_msg_num(),
            rec.plci,
            Params::ConnectB3Req { ncpi: None },
        ));
    }

    fn on_connect_b3_ind(&self, rec: &mut CallRecord, ncci: u32) {
        rec.ncci = ncci;
    }

    fn on_connect_b3_active_ind(&self, line: &Arc<Line>, rec: &mut CallRecord) {
        if rec.state == CallState::Disconnecting {
            debug!(
                "{}: CONNECT_B3_ACTIVE during disconnect (NCCI={:#x})",
                line.name, rec.ncci
            );
            return;
        }
        rec.flags.b3_up = true;
        rec.flags.b3_pending = false;
        rec.flags.rtp_bearer = rec.bearer == BearerProfile::RtpTunnel;
        rec.voice.flow.grant();

        if rec.flags.b3_changing {
            rec.flags.b3_changing = false;
            debug!("{}: B3 protocol changed", line.name);
            return;
        }
        if rec.flags.fax_active {
            debug!("{}: fax connection, no EC/DTMF", line.name);
        } else {
            self.echo_canceller(line, rec, true);
            self.dtmf_listen(line, rec, true);
        }
        if rec.state == CallState::Connected {
            self.signal_answer(line, rec);
        }
    }

    fn on_disconnect_b3_ind(
        &self,
        line: &Arc<Line>,
        rec: &mut CallRecord,
        reason_b3: u16,
        ncpi: Option<Bytes>,
    ) {
        rec.flags.b3_up = false;
        rec.flags.b3_pending = false;
        rec.reason_b3 = reason_b3;
        rec.ncci = 0;
        rec.voice.flow.revoke();

        if rec.flags.fax_active {
            if let Some(ncpi) = ncpi {
                if ncpi.len() >= 8 {
                    debug!(
                        "{}: fax finished (rate={}, pages={})",
                        line.name,
                        u16::from_le_bytes([ncpi[0], ncpi[1]]),
                        u16::from_le_bytes([ncpi[6], ncpi[7]])
                    );
                }
            }
        }
        if rec.state == CallState::Disconnecting {
            // active disconnect continues on the signaling level
            self.send(Message::new(
                self.appl_id,
                self.next_msg_num(),
                rec.plci,
                Params::DisconnectReq,
            ));
        }
    }

    fn on_disconnect_ind(&self, line: &Arc<Line>, rec: &mut CallRecord, reason: u16) {
        let previous = rec.state;
        rec.state = CallState::Disconnected;
        rec.reason = reason;
        if rec.cause == 0 {
            // no cause information element was seen
            rec.cause = if reason & 0xff00 == 0x3400 {
                (reason & 0x7f) as u8
            } else {
                CAUSE_NORMAL_CLEARING
            };
        }
        if rec.flags.fax_active {
            let clean = matches!(reason, 0x3490 | 0x349f) && rec.reason_b3 == 0;
            if !clean {
                warn!(
                    "{}: fax failed (reason={:#06x}, reasonB3={:#06x})",
                    line.name, reason, rec.reason_b3
                );
            }
            rec.flags.fax_active = false;
        }

        if !rec.flags.attached {
            // nobody ever took this call, tear it down out of lock
            debug!("{}: DISCONNECT_IND without host call, cleaning up", line.name);
            self.defer(Deferred::Teardown(Arc::clone(line)));
            return;
        }
        if previous == CallState::Disconnecting {
            self.cleanup_line(line, rec);
        } else {
            let event = if reason == 0x34a2 {
                ControlEvent::Congestion
            } else {
                ControlEvent::Hangup { cause: rec.cause }
            };
            self.defer(Deferred::SoftHangup(Arc::clone(line), event));
        }
    }

    fn on_data_b3_ind(&self, line: &Arc<Line>, rec: &mut CallRecord, data: Bytes) {
        if rec.flags.fax_active {
            trace!("{}: fax data ({} octets)", line.name, data.len());
            line.queue_frame(rec, CallFrame::Voice(data));
            return;
        }
        if rec.flags.b3_changing
            || rec.flags.interconnect_active
            || rec.flags.hangup_queued
            || rec.state == CallState::Disconnecting
        {
            // voice frames are not wanted right now
            return;
        }
        if rec.flags.rtp_bearer {
            // tunneled media passes through untouched
            line.queue_frame(rec, CallFrame::Voice(data));
            return;
        }
        let (block, suppressed) = rec.voice.inbound_block(&data);
        if suppressed {
            trace!("{}: suppressing echo ({} octets)", line.name, block.len());
        }
        line.queue_frame(rec, CallFrame::Voice(block));
    }

    fn on_info_ind(&self, line: &Arc<Line>, rec: &mut CallRecord, info_number: u16, element: &Bytes) {
        match info_number {
            IE_CAUSE => {
                if element.len() >= 2 {
                    rec.cause = element[1] & 0x7f;
                    debug!("{}: cause {:#04x}", line.name, rec.cause);
                }
            }
            IE_CALL_STATE | IE_CHANNEL_ID => {
                debug!("{}: info element {:#06x}", line.name, info_number);
            }
            IE_PROGRESS_INDICATOR => self.on_progress_indicator(line, rec, element),
            IE_CALLED_PARTY_NUMBER => self.on_did_digits(line, rec, element),
            IE_REDIRECTING_NUMBER => {
                if element.len() > 2 {
                    debug!(
                        "{}: redirecting number '{}'",
                        line.name,
                        String::from_utf8_lossy(&element[2..])
                    );
                }
            }
            IE_SENDING_COMPLETE | IE_MSG_SETUP => self.on_setup_element(line, rec),
            IE_MSG_ALERTING => {
                self.send_progress(line, rec);
                line.queue_frame(rec, CallFrame::Control(ControlEvent::Ringing));
            }
            IE_MSG_CALL_PROCEEDING => {
                line.queue_frame(rec, CallFrame::Control(ControlEvent::Proceeding));
            }
            IE_MSG_PROGRESS => {
                // some exchanges deliver USER BUSY, then PROGRESS with
                // in-band busy tone before dropping the line; surface
                // the busy immediately when no early bearer is wanted
                if rec.early_b3 == EarlyB3::Never && rec.cause == CAUSE_USER_BUSY {
                    self.queue_cause_control(line, rec, true);
                } else {
                    self.send_progress(line, rec);
                }
            }
            IE_MSG_SETUP_ACK => {
                rec.flags.setup_ack_received = true;
                if !rec.overlap_digits.is_empty() {
                    // digits of the initial dial string left to send
                    let digits = std::mem::take(&mut rec.overlap_digits);
                    self.send_called_digits(rec, &digits);
                }
            }
            IE_MSG_DISCONNECT => self.on_info_disconnect(line, rec),
            _ => {
                debug!(
                    "{}: unhandled INFO_IND {:#06x} (PLCI={:#x})",
                    line.name, info_number, rec.plci
                );
            }
        }
    }

    fn on_progress_indicator(&self, line: &Arc<Line>, rec: &mut CallRecord, element: &Bytes) {
        if element.len() < 2 {
            debug!("{}: progress description missing", line.name);
            return;
        }
        match element[1] & 0x7f {
            0x01 => debug!("{}: not end-to-end ISDN", line.name),
            0x02 => debug!("{}: destination is not ISDN", line.name),
            0x03 => debug!("{}: origination is not ISDN", line.name),
            0x04 => debug!("{}: call returned to ISDN", line.name),
            0x05 => debug!("{}: interworking occurred", line.name),
            0x08 => debug!("{}: in-band information available", line.name),
            other => debug!("{}: unknown progress description {:#04x}", line.name, other),
        }
        self.send_progress(line, rec);
    }

    fn send_progress(&self, line: &Arc<Line>, rec: &mut CallRecord) {
        if rec.early_b3 != EarlyB3::Never {
            self.start_b3(rec);
        }
        if !rec.flags.progress_sent {
            rec.flags.progress_sent = true;
            line.queue_frame(rec, CallFrame::Control(ControlEvent::Progress));
        }
    }

    fn on_did_digits(&self, line: &Arc<Line>, rec: &mut CallRecord, element: &Bytes) {
        if rec.state != CallState::IncomingDid {
            debug!("{}: DID digits not used in this state", line.name);
            return;
        }
        if element.len() < 2 {
            return;
        }
        let digits = String::from_utf8_lossy(&element[1..]).into_owned();
        let repeated = !rec.flags.did_digits_received
            && !rec.dnid.is_empty()
            && rec.dnid.eq_ignore_ascii_case(&digits);
        if !repeated {
            rec.dnid.push_str(&digits);
        }
        rec.flags.did_digits_received = true;

        if rec.flags.attached {
            // routing already started, forward the digits as DTMF
            if !repeated {
                for d in digits.chars() {
                    line.queue_frame(rec, CallFrame::Digit(d));
                }
            }
            return;
        }
        self.start_call_on_match(line, rec);
    }

    fn on_setup_element(&self, line: &Arc<Line>, rec: &mut CallRecord) {
        if rec.flags.setup_received {
            debug!("{}: SETUP / SENDING-COMPLETE already received", line.name);
            return;
        }
        rec.flags.setup_received = true;
        match line.config.isdn_mode {
            IsdnMode::Did => {
                if rec.dnid.is_empty() && line.config.immediate {
                    self.start_call_on_match(line, rec);
                }
            }
            IsdnMode::Msn => self.start_call_on_match(line, rec),
        }
    }

    /// DISCONNECT information element before the network-level
    /// DISCONNECT_IND. How it is interpreted depends on the direction
    /// and the early-B3 mode of the call.
    fn on_info_disconnect(&self, line: &Arc<Line>, rec: &mut CallRecord) {
        rec.flags.disconnect_received = true;

        if rec.flags.ect_active {
            debug!("{}: disconnect on transferred call", line.name);
            return;
        }
        if rec.flags.hold_active {
            // the held party hung up; release it on the signaling level
            debug!("{}: disconnect of held call", line.name);
            self.send(Message::new(
                self.appl_id,
                self.next_msg_num(),
                rec.held_plci,
                Params::DisconnectReq,
            ));
            return;
        }
        // case 1: outgoing without unconditional early bearer
        if rec.early_b3 != EarlyB3::Always && rec.outgoing {
            debug!("{}: disconnect case 1", line.name);
            self.queue_cause_control(line, rec, true);
            return;
        }
        // case 2: bearer wanted and the call was connected
        if rec.early_b3 != EarlyB3::Never && rec.state == CallState::Connected && rec.outgoing {
            debug!("{}: disconnect case 2", line.name);
            self.queue_cause_control(line, rec, true);
            return;
        }
        // case 3: incoming call, the remote user hung up; do not wait
        // for the network timeout
        if !rec.outgoing {
            debug!("{}: disconnect case 3", line.name);
            if rec.flags.fax_active {
                self.send(Message::new(
                    self.appl_id,
                    self.next_msg_num(),
                    rec.plci,
                    Params::DisconnectReq,
                ));
                return;
            }
            self.queue_cause_control(line, rec, false);
            return;
        }
        // case 4: unconditional early bearer on an unsuccessful call;
        // the in-band announcement keeps playing until the network
        // sends the final disconnect
        if rec.early_b3 == EarlyB3::Always && rec.outgoing {
            debug!("{}: disconnect case 4", line.name);
            if rec.state == CallState::Connected && rec.flags.b3_up {
                self.queue_cause_control(line, rec, true);
            }
            return;
        }
        debug!("{}: disconnect, other case", line.name);
    }

    fn queue_cause_control(&self, line: &Arc<Line>, rec: &mut CallRecord, use_cause: bool) {
        let mut event = ControlEvent::Hangup { cause: rec.cause };
        if use_cause {
            if rec.cause == CAUSE_CIRCUIT_CONGESTION {
                event = ControlEvent::Congestion;
            } else if rec.cause != CAUSE_NO_USER_RESPONSE && rec.cause != CAUSE_NO_ANSWER {
                event = ControlEvent::Busy;
            }
        }
        line.queue_frame(rec, CallFrame::Control(event));
    }

    fn on_facility_ind(&self, line: &Arc<Line>, rec: &mut CallRecord, selector: u16, params: &Bytes) {
        match selector {
            FACILITYSELECTOR_DTMF => match facility::parse_dtmf_digits(params) {
                Ok(digits) => {
                    for &d in &digits {
                        let digit = d as char;
                        debug!("{}: received DTMF '{}'", line.name, digit);
                        if digit == 'X' || digit == 'Y' {
                            self.on_fax_tone(line, rec);
                        } else {
                            line.queue_frame(rec, CallFrame::Digit(digit));
                        }
                    }
                }
                Err(e) => warn!("{}: bad DTMF indication: {}", line.name, e),
            },
            FACILITYSELECTOR_SUPPLEMENTARY => match facility::parse_supplementary_ind(params) {
                Ok(SupplementaryInd { function, reason }) => {
                    self.on_supplementary_ind(line, rec, function, reason)
                }
                Err(e) => warn!("{}: bad supplementary indication: {}", line.name, e),
            },
            FACILITYSELECTOR_LINE_INTERCONNECT => {
                match facility::parse_line_interconnect_function(params) {
                    Ok(facility::LI_CONNECT) => {
                        info!("{}: line interconnect activated", line.name)
                    }
                    Ok(facility::LI_DISCONNECT) => {
                        info!("{}: line interconnect removed", line.name)
                    }
                    Ok(other) => debug!("{}: line interconnect function {:#x}", line.name, other),
                    Err(e) => warn!("{}: bad interconnect indication: {}", line.name, e),
                }
            }
            other => debug!("{}: facility selector {:#x} ignored", line.name, other),
        }
    }

    fn on_supplementary_ind(&self, line: &Arc<Line>, rec: &mut CallRecord, function: u16, reason: u16) {
        match function {
            facility::SUPPL_HOLD => {
                if reason != 0 {
                    rec.held_plci = 0;
                    rec.flags.hold_active = false;
                    warn!(
                        "{}: unable to put PLCI={:#x} on hold (reason={:#06x})",
                        line.name, rec.plci, reason
                    );
                } else {
                    rec.state = CallState::OnHold;
                    info!("{}: PLCI={:#x} put on hold", line.name, rec.plci);
                }
            }
            facility::SUPPL_RETRIEVE => {
                if reason != 0 {
                    warn!(
                        "{}: unable to retrieve PLCI={:#x} (reason={:#06x})",
                        line.name, rec.held_plci, reason
                    );
                } else {
                    rec.state = CallState::Connected;
                    rec.held_plci = 0;
                    rec.flags.hold_active = false;
                    info!("{}: PLCI={:#x} retrieved", line.name, rec.plci);
                    self.start_b3(rec);
                }
            }
            facility::SUPPL_ECT => {
                debug!("{}: ECT result reason={:#06x}", line.name, reason);
            }
            other => debug!(
                "{}: supplementary indication {:#x} (reason={:#06x})",
                line.name, other, reason
            ),
        }
    }

    fn on_fax_tone(&self, line: &Arc<Line>, rec: &mut CallRecord) {
        if rec.flags.fax_handled {
            debug!("{}: fax tone already handled", line.name);
            return;
        }
        rec.flags.fax_handled = true;
        if !line.config.fax_detect.wants(rec.outgoing) {
            debug!(
                "{}: fax tone detected but not configured for redirection",
                line.name
            );
            return;
        }
        info!("{}: fax tone detected", line.name);
        line.queue_frame(rec, CallFrame::Control(ControlEvent::FaxTone));
    }

    fn on_facility_conf(
        &self,
        line: &Arc<Line>,
        rec: &mut CallRecord,
        info: u16,
        selector: u16,
        params: &Bytes,
    ) {
        match selector {
            FACILITYSELECTOR_DTMF => {
                debug!("{}: DTMF facility confirmed (PLCI={:#x})", line.name, rec.plci);
            }
            s if s == line.config.echo_cancel_selector => {
                if info != 0 {
                    warn!(
                        "{}: error setting up echo canceller (PLCI={:#x})",
                        line.name, rec.plci
                    );
                    return;
                }
                match facility::parse_echo_cancel_conf(params) {
                    Ok(facility::EC_DISABLE) => {
                        debug!("{}: echo canceller disabled", line.name)
                    }
                    Ok(_) => debug!("{}: echo canceller set up", line.name),
                    Err(e) => warn!("{}: bad echo canceller confirmation: {}", line.name, e),
                }
            }
            FACILITYSELECTOR_SUPPLEMENTARY => match facility::parse_supplementary_conf(params) {
                Ok(conf) => debug!(
                    "{}: supplementary confirmation function={:#x} info={:#06x}",
                    line.name, conf.function, conf.info
                ),
                Err(e) => warn!("{}: bad supplementary confirmation: {}", line.name, e),
            },
            FACILITYSELECTOR_LINE_INTERCONNECT => {
                debug!("{}: line interconnect confirmation info={:#06x}", line.name, info);
            }
            other => warn!("{}: unhandled FACILITY_CONF selector {:#x}", line.name, other),
        }
    }

    // ------------------------------------------------------------------
    // host operations
    // ------------------------------------------------------------------

    /// Place an outgoing call. Reserves an idle line and a free B
    /// channel, sends CONNECT_REQ and waits for its confirmation.
    pub fn dial(
        &self,
        selector: &LineSelector,
        destination: &str,
        options: DialOptions,
    ) -> Result<CallHandle> {
        if destination.is_empty() && options.early_b3 != EarlyB3::Always {
            return Err(Error::invalid_state(
                "no destination and no unconditional early bearer requested",
            ));
        }

        let (line, frames) = self.reserve_line(selector, destination, &options)?;
        let mut rec = line.lock();

        let caller = options.caller_id.clone().unwrap_or_default();
        rec.cid = caller.clone();
        rec.early_b3 = options.early_b3;
        info!(
            "{}: calling '{}'{}{}",
            line.name,
            destination,
            if options.early_b3 != EarlyB3::Never {
                " with early B3"
            } else {
                ""
            },
            if options.overlap { " overlap" } else { "" }
        );

        let called = if options.overlap && !destination.is_empty() {
            rec.overlap_digits = destination.to_string();
            Some(CalledNumber::new(""))
        } else {
            Some(CalledNumber::new(destination))
        };
        let calling = if caller.is_empty() {
            None
        } else {
            Some(CallingNumber::new(
                &caller,
                options.caller_ton & 0x7f,
                options.presentation,
            ))
        };

        let msg_num = self.next_msg_num();
        rec.msg_num = msg_num;
        self.registry.register_msgnum(msg_num, Arc::clone(&line));

        let params = Params::ConnectReq {
            cip: 0x10, // telephony
            called,
            calling,
            called_sub: None,
            calling_sub: None,
            b_protocol: BProtocol::for_profile(rec.bearer),
            bchannel_info: Some(Bytes::from_static(&[0x00, 0x00])),
        };
        let msg = Message::new(self.appl_id, msg_num, rec.controller as u32, params);

        let sent = self.put(&msg).and_then(|_| {
            line.wait_confirmation(&mut rec, Command::Connect, self.confirmation_timeout)
        });
        if let Err(e) = sent {
            self.cleanup_line(&line, &mut rec);
            return Err(e);
        }
        if rec.plci != 0 && rec.state == CallState::Disconnected {
            rec.state = CallState::ConnectPending;
        } else if rec.plci == 0 {
            // confirmation carried an error; the busy event is queued
            debug!("{}: connect attempt rejected", line.name);
        }
        drop(rec);
        Ok(CallHandle { line, frames })
    }

    fn reserve_line(
        &self,
        selector: &LineSelector,
        destination: &str,
        _options: &DialOptions,
    ) -> Result<(Arc<Line>, mpsc::Receiver<CallFrame>)> {
        let controller_count = self.controllers.count() as u8;
        for line in &self.lines {
            let selector_controller = match selector {
                LineSelector::Name(name) => {
                    if !line.name.eq_ignore_ascii_case(name) {
                        continue;
                    }
                    None
                }
                LineSelector::Group(group) => {
                    if line.config.group != *group {
                        continue;
                    }
                    None
                }
                LineSelector::Controller(c) => {
                    if !line.uses_controller(*c) {
                        continue;
                    }
                    Some(*c)
                }
            };
            let mut rec = line.lock();
            if rec.in_use() {
                continue;
            }
            let reserved = match selector_controller {
                Some(c) => self.controllers.reserve_channel(c).ok().map(|_| c),
                None => (1..=controller_count)
                    .filter(|c| line.uses_controller(*c))
                    .find(|c| self.controllers.reserve_channel(*c).is_ok()),
            };
            let controller = match reserved {
                Some(c) => c,
                None => continue,
            };
            rec.channel_reserved = true;
            rec.controller = controller;
            rec.outgoing = true;
            rec.flags.attached = true;
            rec.flags.routed = true;
            rec.dnid = destination.to_string();
            let (tx, rx) = mpsc::channel();
            rec.sender = Some(tx);
            return Ok((Arc::clone(line), rx));
        }
        Err(Error::resource_exhausted(format!(
            "no free line for {:?}",
            selector
        )))
    }

    /// Signal ringing towards the caller of an incoming call.
    pub fn alert(&self, call: &CallHandle) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();
        if !matches!(rec.state, CallState::IncomingCall | CallState::IncomingDid) {
            debug!("{}: attempted ALERT in state {:?}", line.name, rec.state);
            return Err(Error::invalid_state("call not in an incoming state"));
        }
        self.put(&Message::new(
            self.appl_id,
            self.next_msg_num(),
            rec.plci,
            Params::AlertReq,
        ))?;
        rec.state = CallState::Alerting;
        Ok(())
    }

    /// Accept an incoming call.
    pub fn answer(&self, call: &CallHandle) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();
        if rec.outgoing || rec.plci == 0 {
            return Err(Error::invalid_state("not an incoming call"));
        }
        rec.bearer = BearerProfile::Transparent;
        self.send_answer(line, &mut rec, None)
    }

    fn send_answer(&self, line: &Arc<Line>, rec: &mut CallRecord, b3_config: Option<Bytes>) -> Result<()> {
        let connected = if rec.dnid.is_empty() {
            None
        } else {
            Some(ConnectedNumber::new(&rec.dnid))
        };
        let b_protocol = match b3_config {
            Some(cfg) => BProtocol::with_b3_config(rec.bearer, cfg),
            None => BProtocol::for_profile(rec.bearer),
        };
        info!("{}: answering for '{}'", line.name, rec.dnid);
        self.put(&Message::new(
            self.appl_id,
            rec.msg_num,
            rec.plci,
            Params::ConnectResp {
                reject: REJECT_ACCEPT,
                connected,
                b_protocol: Some(b_protocol),
            },
        ))?;
        rec.state = CallState::Answering;
        rec.early_b3 = EarlyB3::Never;
        rec.outgoing = false;
        Ok(())
    }

    /// Hang up. Safe to call repeatedly; a call already torn down is a
    /// no-op.
    pub fn hangup(&self, call: &CallHandle) -> Result<()> {
        self.hangup_with_cause(call, 0)
    }

    pub fn hangup_with_cause(&self, call: &CallHandle, cause: u8) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();
        if !rec.in_use() {
            debug!("{}: hangup on idle line", line.name);
            return Ok(());
        }
        if rec.state == CallState::Disconnected {
            // passive disconnect already done, only cleanup is left
            self.cleanup_line(line, &mut rec);
            return Ok(());
        }
        self.active_hangup(line, &mut rec, cause);
        Ok(())
    }

    fn active_hangup(&self, line: &Arc<Line>, rec: &mut MutexGuard<'_, CallRecord>, cause: u8) {
        let previous = rec.state;
        rec.state = CallState::Disconnecting;
        if cause != 0 {
            rec.cause = cause;
        }
        if rec.flags.ect_active {
            // transferred away; just wait for DISCONNECT_IND
            debug!("{}: hangup of transferred call", line.name);
            return;
        }
        debug!("{}: active hangup (cause={})", line.name, rec.cause);

        if matches!(
            previous,
            CallState::Alerting | CallState::IncomingDid | CallState::IncomingCall
        ) {
            let reject = if rec.cause != 0 {
                0x3480 | (rec.cause & 0x7f) as u16
            } else {
                REJECT_NORMAL_CLEARING
            };
            self.send(Message::new(
                self.appl_id,
                rec.msg_num,
                rec.plci,
                Params::ConnectResp {
                    reject,
                    connected: None,
                    b_protocol: None,
                },
            ));
            return;
        }
        if rec.flags.b3_up {
            let ncci = rec.ncci;
            if let Err(e) = self.send_request_and_wait(
                line,
                rec,
                ncci,
                Params::DisconnectB3Req { ncpi: None },
            ) {
                warn!("{}: {}", line.name, e);
            }
            return;
        }
        if matches!(
            previous,
            CallState::Connected
                | CallState::ConnectPending
                | CallState::Answering
                | CallState::OnHold
        ) {
            let plci = rec.plci;
            if let Err(e) =
                self.send_request_and_wait(line, rec, plci, Params::DisconnectReq)
            {
                warn!("{}: {}", line.name, e);
            }
        }
    }

    /// Feed outbound audio. Chunked into transport blocks, each taking
    /// one flow-control credit; blocks beyond the window are dropped.
    pub fn write_audio(&self, call: &CallHandle, frame: &[u8]) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();
        if !rec.flags.b3_up
            || rec.ncci == 0
            || rec.flags.b3_changing
            || rec.flags.interconnect_active
        {
            return Ok(());
        }
        if rec.state != CallState::Connected {
            return Ok(());
        }
        if rec.flags.fax_active {
            debug!("{}: write while receiving fax", line.name);
            return Ok(());
        }
        if frame.is_empty() {
            return Ok(());
        }

        if rec.flags.rtp_bearer {
            // tunneled media bypasses reframing and companding
            let data = Bytes::copy_from_slice(frame);
            self.send_data_block(line, &mut rec, data);
            return Ok(());
        }

        rec.voice.reframer.feed(frame);
        while let Some(block) = rec.voice.reframer.next_block() {
            let wire = rec.voice.outbound_block(&block);
            self.send_data_block(line, &mut rec, wire);
        }
        Ok(())
    }

    fn send_data_block(&self, line: &Arc<Line>, rec: &mut CallRecord, data: Bytes) {
        if !rec.voice.flow.try_consume() {
            debug!(
                "{}: too much voice to send for NCCI={:#x}",
                line.name, rec.ncci
            );
            return;
        }
        let handle = rec.send_handle;
        rec.send_handle = rec.send_handle.wrapping_add(1);
        let msg = Message::new(
            self.appl_id,
            self.next_msg_num(),
            rec.ncci,
            Params::DataB3Req {
                data,
                handle,
                flags: 0,
            },
        );
        if self.put(&msg).is_err() {
            rec.voice.flow.replenish();
        }
    }

    /// Send a DTMF digit: via overlap dialing while the call is being
    /// established, via the adapter DTMF facility once connected.
    pub fn send_digit(&self, call: &CallHandle, digit: char) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();

        if rec.state == CallState::ConnectPending {
            rec.dnid.push(digit);
            if rec.flags.setup_ack_received && rec.overlap_digits.is_empty() {
                let digits = digit.to_string();
                self.send_called_digits(&mut rec, &digits);
            } else {
                // no SETUP_ACK yet, add it to the overlap queue
                rec.overlap_digits.push(digit);
            }
            return Ok(());
        }
        if rec.state == CallState::Connected && rec.flags.b3_up {
            let hw = self
                .controllers
                .get(rec.controller)
                .map(|c| c.dtmf)
                .unwrap_or(false);
            if !hw || !rec.dtmf_detect {
                return Err(Error::not_supported(
                    "no adapter DTMF on this connection",
                ));
            }
            self.put(&Message::new(
                self.appl_id,
                self.next_msg_num(),
                rec.ncci,
                Params::FacilityReq {
                    selector: FACILITYSELECTOR_DTMF,
                    params: facility::dtmf_send(digit),
                },
            ))?;
            debug!("{}: sent DTMF '{}'", line.name, digit);
        }
        Ok(())
    }

    fn send_called_digits(&self, rec: &mut CallRecord, digits: &str) {
        self.send(Message::new(
            self.appl_id,
            self.next_msg_num(),
            rec.plci,
            Params::InfoReq {
                called: Some(CalledNumber::new(digits)),
            },
        ));
    }

    /// Put the connected call on hold.
    pub fn hold(&self, call: &CallHandle) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();
        if rec.flags.hold_active {
            debug!("{}: already on hold", line.name);
            return Ok(());
        }
        if !rec.flags.b3_up {
            return Err(Error::invalid_state("cannot hold while not connected"));
        }
        if !self.controller_supports(rec.controller, |c| c.hold_retrieve) {
            return Err(Error::not_supported("HOLD not supported by controller"));
        }
        self.put(&Message::new(
            self.appl_id,
            self.next_msg_num(),
            rec.plci,
            Params::FacilityReq {
                selector: FACILITYSELECTOR_SUPPLEMENTARY,
                params: facility::supplementary_simple(facility::SUPPL_HOLD),
            },
        ))?;
        debug!("{}: sent HOLD for PLCI={:#x}", line.name, rec.plci);
        rec.held_plci = rec.plci;
        rec.flags.hold_active = true;
        Ok(())
    }

    /// Retrieve the held call.
    pub fn retrieve(&self, call: &CallHandle) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();
        if rec.held_plci == 0 || rec.state != CallState::OnHold {
            return Err(Error::invalid_state("call is not on hold"));
        }
        if !self.controller_supports(rec.controller, |c| c.hold_retrieve) {
            return Err(Error::not_supported("RETRIEVE not supported by controller"));
        }
        let held = rec.held_plci;
        self.put(&Message::new(
            self.appl_id,
            self.next_msg_num(),
            held,
            Params::FacilityReq {
                selector: FACILITYSELECTOR_SUPPLEMENTARY,
                params: facility::supplementary_simple(facility::SUPPL_RETRIEVE),
            },
        ))?;
        debug!("{}: sent RETRIEVE for PLCI={:#x}", line.name, held);
        Ok(())
    }

    /// Explicit call transfer: connect the held call with the active
    /// one and drop out of both.
    pub fn transfer(&self, active: &CallHandle, held: &CallHandle) -> Result<()> {
        let held_plci = {
            let rec = held.line.lock();
            if !rec.flags.hold_active {
                return Err(Error::invalid_state("transfer target is not on hold"));
            }
            rec.held_plci
        };

        let line = &active.line;
        let mut rec = line.lock();
        if !self.controller_supports(rec.controller, |c| c.ect) {
            return Err(Error::not_supported("ECT not supported by controller"));
        }
        if rec.flags.b3_up {
            let ncci = rec.ncci;
            if let Err(e) = self.send_request_and_wait(
                line,
                &mut rec,
                ncci,
                Params::DisconnectB3Req { ncpi: None },
            ) {
                warn!("{}: {}", line.name, e);
            }
        }
        if rec.state != CallState::Connected {
            return Err(Error::invalid_state("transfer source not connected"));
        }
        self.send_request_and_wait(
            line,
            &mut rec,
            held_plci,
            Params::FacilityReq {
                selector: FACILITYSELECTOR_SUPPLEMENTARY,
                params: facility::supplementary_ect(held_plci),
            },
        )?;
        rec.flags.ect_active = true;
        info!(
            "{}: sent ECT for PLCI={:#x} to PLCI={:#x}",
            line.name, held_plci, rec.plci
        );
        drop(rec);

        let mut held_rec = held.line.lock();
        held_rec.flags.hold_active = false;
        held_rec.flags.ect_active = true;
        Ok(())
    }

    /// Join the media paths of two connected calls inside the adapter.
    pub fn line_interconnect(&self, a: &CallHandle, b: &CallHandle, start: bool) -> Result<()> {
        // stable lock order between two call records
        let (first, second) = if a.line.index <= b.line.index {
            (&a.line, &b.line)
        } else {
            (&b.line, &a.line)
        };
        let mut rec_a = first.lock();
        let mut rec_b = second.lock();
        if rec_a.flags.disconnect_received || rec_b.flags.disconnect_received {
            return Err(Error::invalid_state("a party is already disconnecting"));
        }
        if start && (!rec_a.flags.b3_up || !rec_b.flags.b3_up) {
            debug!(
                "{}:{}: line interconnect aborted, a channel is not connected",
                first.name, second.name
            );
            return Err(Error::invalid_state("both channels must be connected"));
        }
        let params = if start {
            facility::line_interconnect_connect(rec_b.plci)
        } else {
            facility::line_interconnect_disconnect(rec_b.plci)
        };
        self.put(&Message::new(
            self.appl_id,
            self.next_msg_num(),
            rec_a.plci,
            Params::FacilityReq {
                selector: FACILITYSELECTOR_LINE_INTERCONNECT,
                params,
            },
        ))?;
        rec_a.flags.interconnect_active = start;
        rec_b.flags.interconnect_active = start;
        Ok(())
    }

    /// Tag the active call as malicious at the exchange.
    pub fn report_malicious(&self, call: &CallHandle) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();
        if !self.controller_supports(rec.controller, |c| c.mcid) {
            return Err(Error::not_supported("MCID not supported by controller"));
        }
        let plci = rec.plci;
        self.send_request_and_wait(
            line,
            &mut rec,
            plci,
            Params::FacilityReq {
                selector: FACILITYSELECTOR_SUPPLEMENTARY,
                params: facility::supplementary_simple(facility::SUPPL_MCID),
            },
        )?;
        debug!("{}: sent MCID for PLCI={:#x}", line.name, plci);
        Ok(())
    }

    /// Toggle the adapter echo canceller for this call.
    pub fn set_echo_canceller(&self, call: &CallHandle, enable: bool) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();
        rec.echo_cancel = enable;
        self.echo_canceller(line, &mut rec, enable);
        Ok(())
    }

    /// Toggle the software echo suppression heuristic.
    pub fn set_echo_squelch(&self, call: &CallHandle, enable: bool) -> Result<()> {
        let mut rec = call.line.lock();
        rec.voice.echo_squelch = enable;
        Ok(())
    }

    /// Switch the call to the fax bearer and start receiving. The
    /// payload arrives as voice frames on the call queue; storing it is
    /// the host's business.
    pub fn start_fax_receive(
        &self,
        call: &CallHandle,
        station_id: &str,
        headline: &str,
    ) -> Result<()> {
        let line = &call.line;
        let mut rec = line.lock();
        let b3_config = fax_b3_config(0, station_id, headline);
        rec.flags.fax_active = true;
        rec.bearer = BearerProfile::FaxG3;
        match rec.state {
            CallState::Alerting | CallState::IncomingDid | CallState::IncomingCall => {
                self.send_answer(line, &mut rec, Some(b3_config))
            }
            CallState::Connected => {
                if rec.flags.b3_up {
                    let ncci = rec.ncci;
                    if let Err(e) = self.send_request_and_wait(
                        line,
                        &mut rec,
                        ncci,
                        Params::DisconnectB3Req { ncpi: None },
                    ) {
                        warn!("{}: {}", line.name, e);
                    }
                }
                let plci = rec.plci;
                // no writes while the bearer renegotiates; cleared when
                // the new connection comes up
                rec.flags.b3_changing = true;
                let b_protocol = BProtocol::with_b3_config(BearerProfile::FaxG3, b3_config);
                self.put(&Message::new(
                    self.appl_id,
                    self.next_msg_num(),
                    plci,
                    Params::SelectBProtocolReq { b_protocol },
                ))
            }
            _ => {
                rec.flags.fax_active = false;
                Err(Error::invalid_state("fax receive in wrong call state"))
            }
        }
    }

    fn controller_supports<F: Fn(&ControllerInfo) -> bool>(&self, controller: u8, f: F) -> bool {
        self.controllers.get(controller).map(|c| f(&c)).unwrap_or(false)
    }

    /// Adapter echo canceller control, gated on capability, call
    /// configuration and call phase.
    fn echo_canceller(&self, line: &Arc<Line>, rec: &mut CallRecord, enable: bool) {
        if rec.flags.disconnect_received {
            return;
        }
        if enable == rec.flags.echo_cancel_active {
            debug!(
                "{}: echo canceller (PLCI={:#x}) unchanged",
                line.name, rec.plci
            );
            return;
        }
        if !rec.echo_cancel || !self.controller_supports(rec.controller, |c| c.echo_cancel) {
            return;
        }
        let function = if enable {
            facility::EC_ENABLE
        } else {
            facility::EC_DISABLE
        };
        info!(
            "{}: setting up echo canceller (PLCI={:#x}, function={}, options={}, tail={})",
            line.name, rec.plci, function, line.config.echo_cancel_option, line.config.echo_cancel_tail
        );
        rec.flags.echo_cancel_active = enable;
        self.send(Message::new(
            self.appl_id,
            self.next_msg_num(),
            rec.plci,
            Params::FacilityReq {
                selector: line.config.echo_cancel_selector,
                params: facility::echo_cancel(
                    function,
                    line.config.echo_cancel_option,
                    line.config.echo_cancel_tail,
                ),
            },
        ));
    }

    /// Arm or disarm the adapter DTMF detector.
    fn dtmf_listen(&self, line: &Arc<Line>, rec: &mut CallRecord, on: bool) {
        if rec.flags.disconnect_received {
            return;
        }
        if !rec.dtmf_detect || !self.controller_supports(rec.controller, |c| c.dtmf) {
            // host-side detection has to do it
            return;
        }
        debug!(
            "{}: setting up DTMF detector (PLCI={:#x}, on={})",
            line.name, rec.plci, on
        );
        self.send(Message::new(
            self.appl_id,
            self.next_msg_num(),
            rec.plci,
            Params::FacilityReq {
                selector: FACILITYSELECTOR_DTMF,
                params: facility::dtmf_listen(on),
            },
        ));
    }
}

impl Drop for CapiEngine {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            if let Some(handle) = self.dispatch.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

/// B3 configuration block of the fax bearer: resolution, format and the
/// two length-prefixed identification strings.
fn fax_b3_config(format: u16, station_id: &str, headline: &str) -> Bytes {
    let mut w = crate::capi::codec::CapiWriter::new();
    w.u16(0); // resolution
    w.u16(format);
    w.capi_struct(station_id.as_bytes());
    w.capi_struct(headline.as_bytes());
    w.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capi::transport::SimulatedTransport;
    use crate::config::CapiConfig;

    fn test_config(confirm_ms: u64) -> CapiConfig {
        let mut config = CapiConfig::default_config();
        config.engine.confirmation_timeout_ms = confirm_ms;
        config.engine.poll_interval_ms = 5;
        config.lines[0].name = "isdn".to_string();
        config.lines[0].devices = 2;
        config
    }

    fn start_engine(
        config: &CapiConfig,
        b_channels: u32,
    ) -> (
        Arc<CapiEngine>,
        Arc<SimulatedTransport>,
        mpsc::Receiver<IncomingCall>,
    ) {
        let transport = Arc::new(SimulatedTransport::single(b_channels));
        let engine = CapiEngine::new(transport.clone(), config).unwrap();
        let incoming = engine.take_incoming_receiver().unwrap();
        engine.start().unwrap();
        (engine, transport, incoming)
    }

    fn connect_ind(plci: u32, msg_num: u16, called: &str, caller: &str) -> Message {
        Message::new(
            1,
            msg_num,
            plci,
            Params::ConnectInd {
                cip: 0x10,
                called: Some(CalledNumber::new(called)),
                calling: Some(CallingNumber::new(caller, 0, 0)),
                called_sub: None,
                calling_sub: None,
                bchannel_info: Some(Bytes::from_static(&[0x00, 0x00])),
            },
        )
    }

    fn info_ind(plci: u32, msg_num: u16, info_number: u16, element: &[u8]) -> Message {
        Message::new(
            1,
            msg_num,
            plci,
            Params::InfoInd {
                info_number,
                element: Bytes::copy_from_slice(element),
            },
        )
    }

    fn wait_until<F: Fn() -> bool>(pred: F, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(3));
        }
        false
    }

    #[test]
    fn test_incoming_call_full_lifecycle() {
        let config = test_config(500);
        let (engine, transport, incoming) = start_engine(&config, 2);
        let plci = 0x0101;
        let ncci = 0x0001_0101;

        transport.push(&connect_ind(plci, 10, "12345", "6789"));
        transport.push(&info_ind(plci, 11, IE_MSG_SETUP, &[]));
        let call = incoming
            .recv_timeout(Duration::from_secs(2))
            .expect("routed incoming call");
        assert_eq!(call.called, "12345");
        assert_eq!(call.caller, "6789");

        engine.answer(&call.handle).unwrap();
        let resp = transport
            .wait_for_sent(
                |m| matches!(m.params, Params::ConnectResp { reject: 0, .. }),
                Duration::from_secs(1),
            )
            .expect("answer response");
        assert_eq!(resp.msg_num, 10, "answer echoes the CONNECT_IND number");

        transport.push(&Message::new(
            1,
            12,
            plci,
            Params::ConnectActiveInd { connected: None },
        ));
        transport.push(&Message::new(1, 13, ncci, Params::ConnectB3Ind { ncpi: None }));
        transport.push(&Message::new(
            1,
            14,
            ncci,
            Params::ConnectB3ActiveInd { ncpi: None },
        ));
        transport
            .wait_for_sent(
                |m| matches!(m.params, Params::ConnectB3ActiveResp),
                Duration::from_secs(1),
            )
            .expect("bearer acknowledged");
        assert!(wait_until(
            || engine.line_status().iter().any(|s| s.state == CallState::Connected),
            Duration::from_secs(1)
        ));

        // inbound voice is acknowledged and lands on the frame queue
        transport.push(&Message::new(
            1,
            15,
            ncci,
            Params::DataB3Ind {
                data: Bytes::from(vec![0u8; B3_BLOCK_SIZE]),
                handle: 3,
                flags: 0,
            },
        ));
        transport
            .wait_for_sent(
                |m| matches!(m.params, Params::DataB3Resp { handle: 3 }),
                Duration::from_secs(1),
            )
            .expect("receive acknowledgement");
        match call.handle.frames.recv_timeout(Duration::from_secs(1)) {
            Ok(CallFrame::Voice(block)) => assert_eq!(block.len(), B3_BLOCK_SIZE),
            other => panic!("expected voice frame, got {:?}", other.map(|_| ())),
        }

        transport.push(&Message::new(
            1,
            16,
            ncci,
            Params::DisconnectB3Ind {
                reason_b3: 0,
                ncpi: None,
            },
        ));
        transport.push(&Message::new(1, 17, plci, Params::DisconnectInd { reason: 0x3490 }));

        // the hangup event carries the embedded cause
        let mut saw_hangup = false;
        while let Ok(frame) = call.handle.frames.recv_timeout(Duration::from_secs(1)) {
            if let CallFrame::Control(ControlEvent::Hangup { cause }) = frame {
                assert_eq!(cause, 0x10);
                saw_hangup = true;
                break;
            }
        }
        assert!(saw_hangup, "hangup event delivered");

        engine.hangup(&call.handle).unwrap();
        assert!(wait_until(
            || engine.line_status().iter().all(|s| s.direction == '-'),
            Duration::from_secs(1)
        ));
        assert_eq!(engine.controller_status()[0].free_channels, 2);

        // a second hangup on the torn-down call is a no-op
        engine.hangup(&call.handle).unwrap();
        engine.stop();
    }

    #[test]
    fn test_did_prefix_is_stripped() {
        let mut config = test_config(500);
        config.lines[0].isdn_mode = IsdnMode::Did;
        config.lines[0].incoming_msn = "43".to_string();
        let (engine, transport, _incoming) = start_engine(&config, 2);

        transport.push(&connect_ind(0x0101, 20, "4321", "555"));
        assert!(wait_until(
            || {
                engine
                    .line_status()
                    .iter()
                    .any(|s| s.state == CallState::IncomingDid && s.called == "21")
            },
            Duration::from_secs(1)
        ));
        engine.stop();
    }

    #[test]
    fn test_second_connect_ind_for_owned_plci_is_ignored() {
        let config = test_config(500);
        let (engine, transport, _incoming) = start_engine(&config, 2);

        transport.push(&connect_ind(0x0101, 21, "100", "200"));
        assert!(wait_until(
            || engine.line_status().iter().filter(|s| s.direction == 'I').count() == 1,
            Duration::from_secs(1)
        ));
        transport.push(&connect_ind(0x0101, 22, "100", "200"));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            engine
                .line_status()
                .iter()
                .filter(|s| s.direction == 'I')
                .count(),
            1,
            "owned PLCI must not be taken twice"
        );
        engine.stop();
    }

    #[test]
    fn test_dial_times_out_against_mute_adapter() {
        let config = test_config(100);
        let (engine, transport, _incoming) = start_engine(&config, 2);
        transport.set_mute(true);

        let err = engine
            .dial(
                &LineSelector::Name("isdn".to_string()),
                "999",
                DialOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // everything the attempt took is given back
        assert!(engine.line_status().iter().all(|s| s.direction == '-'));
        assert_eq!(engine.controller_status()[0].free_channels, 2);
        engine.stop();
    }

    #[test]
    fn test_concurrent_dials_one_free_channel() {
        let config = test_config(1000);
        let (engine, transport, _incoming) = start_engine(&config, 1);

        let mut workers = Vec::new();
        for destination in ["111", "222"] {
            let engine = Arc::clone(&engine);
            workers.push(std::thread::spawn(move || {
                engine.dial(
                    &LineSelector::Name("isdn".to_string()),
                    destination,
                    DialOptions::default(),
                )
            }));
        }

        // exactly one CONNECT_REQ reaches the adapter; confirm it
        let req = transport
            .wait_for_sent(
                |m| matches!(m.params, Params::ConnectReq { .. }),
                Duration::from_secs(2),
            )
            .expect("one connect request");
        transport.push(&Message::new(
            1,
            req.msg_num,
            0x0101,
            Params::ConnectConf { info: 0 },
        ));

        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(Error::ResourceExhausted(_))))
            .count();
        assert_eq!(ok, 1, "exactly one dial wins the single free channel");
        assert_eq!(exhausted, 1, "the loser fails with ResourceExhausted");

        let sent = transport.sent();
        assert_eq!(
            sent.iter()
                .filter(|m| matches!(m.params, Params::ConnectReq { .. }))
                .count(),
            1
        );
        engine.stop();
    }

    #[test]
    fn test_outgoing_credit_window_limits_in_flight_blocks() {
        let config = test_config(1000);
        let (engine, transport, _incoming) = start_engine(&config, 2);

        let dialer = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                engine.dial(
                    &LineSelector::Name("isdn".to_string()),
                    "42",
                    DialOptions::default(),
                )
            })
        };
        let req = transport
            .wait_for_sent(
                |m| matches!(m.params, Params::ConnectReq { .. }),
                Duration::from_secs(2),
            )
            .expect("connect request");
        transport.push(&Message::new(1, req.msg_num, 0x0101, Params::ConnectConf { info: 0 }));
        let call = dialer.join().unwrap().expect("dial confirmed");

        transport.push(&Message::new(
            1,
            30,
            0x0101,
            Params::ConnectActiveInd { connected: None },
        ));
        let b3 = transport
            .wait_for_sent(
                |m| matches!(m.params, Params::ConnectB3Req { .. }),
                Duration::from_secs(1),
            )
            .expect("outgoing bearer request");
        transport.push(&Message::new(1, b3.msg_num, 0x0001_0101, Params::ConnectB3Conf { info: 0 }));
        transport.push(&Message::new(
            1,
            31,
            0x0001_0101,
            Params::ConnectB3ActiveInd { ncpi: None },
        ));
        assert!(wait_until(
            || engine.line_status().iter().any(|s| {
                s.state == CallState::Connected && s.flags.contains('B')
            }),
            Duration::from_secs(1)
        ));

        // feed twice the window; only the window may be in flight
        let frame = vec![0u8; B3_BLOCK_SIZE];
        for _ in 0..(2 * B3_BLOCK_WINDOW) {
            engine.write_audio(&call, &frame).unwrap();
        }
        let data_sent = transport
            .sent()
            .iter()
            .filter(|m| matches!(m.params, Params::DataB3Req { .. }))
            .count();
        assert_eq!(data_sent, B3_BLOCK_WINDOW, "window bounds in-flight blocks");

        // one confirmation buys exactly one more block
        let first = transport
            .wait_for_sent(
                |m| matches!(m.params, Params::DataB3Req { .. }),
                Duration::from_secs(1),
            )
            .unwrap();
        if let Params::DataB3Req { handle, .. } = first.params {
            transport.push(&Message::new(
                1,
                first.msg_num,
                0x0001_0101,
                Params::DataB3Conf { handle, info: 0 },
            ));
        }
        assert!(wait_until(
            || {
                engine.write_audio(&call, &frame).unwrap();
                transport
                    .sent()
                    .iter()
                    .filter(|m| matches!(m.params, Params::DataB3Req { .. }))
                    .count()
                    == B3_BLOCK_WINDOW + 1
            },
            Duration::from_secs(1)
        ));
        engine.stop();
    }

    #[test]
    fn test_transport_fatal_halts_engine() {
        let config = test_config(500);
        let (engine, transport, _incoming) = start_engine(&config, 2);
        assert!(!engine.is_failed());
        transport.set_fatal();
        assert!(wait_until(|| engine.is_failed(), Duration::from_secs(1)));
    }

    #[test]
    fn test_malformed_buffer_does_not_kill_dispatch() {
        let config = test_config(500);
        let (engine, transport, _incoming) = start_engine(&config, 2);

        transport.push_raw(&[0xff, 0x00, 0x01, 0x02, 0x03]);
        transport.push_raw(&[]);
        // a valid indication afterwards is still processed
        transport.push(&connect_ind(0x0101, 40, "777", "888"));
        assert!(wait_until(
            || engine.line_status().iter().any(|s| s.direction == 'I'),
            Duration::from_secs(1)
        ));
        assert!(!engine.is_failed());
        engine.stop();
    }
}

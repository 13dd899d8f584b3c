//! CAPI 2.0 message set
//!
//! Typed encode/decode for the commands this engine exchanges with the
//! adapter. Every message shares an eight-octet header (total length,
//! application id, command, subcommand, message number) followed by the
//! four-octet controller/PLCI/NCCI address dword and command-specific
//! parameters.

use bytes::Bytes;

use crate::capi::codec::{CapiReader, CapiWriter};
use crate::{Error, Result};

/// Header octets before the address dword.
pub const HEADER_LEN: usize = 8;

/// Facility selectors used by this engine.
pub const FACILITYSELECTOR_DTMF: u16 = 0x0001;
pub const FACILITYSELECTOR_SUPPLEMENTARY: u16 = 0x0003;
pub const FACILITYSELECTOR_LINE_INTERCONNECT: u16 = 0x0005;
pub const FACILITYSELECTOR_ECHO_CANCEL: u16 = 0x0008;

/// CONNECT_RESP reject values.
pub const REJECT_ACCEPT: u16 = 0;
pub const REJECT_IGNORE: u16 = 1;
pub const REJECT_NORMAL_CLEARING: u16 = 2;
pub const REJECT_BUSY: u16 = 3;
pub const REJECT_CONGESTION: u16 = 4;

/// Command classes carried in the message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Alert,
    Connect,
    ConnectActive,
    Disconnect,
    Listen,
    Info,
    SelectBProtocol,
    Facility,
    ConnectB3,
    ConnectB3Active,
    DisconnectB3,
    DataB3,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Alert => 0x01,
            Command::Connect => 0x02,
            Command::ConnectActive => 0x03,
            Command::Disconnect => 0x04,
            Command::Listen => 0x05,
            Command::Info => 0x08,
            Command::SelectBProtocol => 0x41,
            Command::Facility => 0x80,
            Command::ConnectB3 => 0x82,
            Command::ConnectB3Active => 0x83,
            Command::DisconnectB3 => 0x84,
            Command::DataB3 => 0x86,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Command::Alert,
            0x02 => Command::Connect,
            0x03 => Command::ConnectActive,
            0x04 => Command::Disconnect,
            0x05 => Command::Listen,
            0x08 => Command::Info,
            0x41 => Command::SelectBProtocol,
            0x80 => Command::Facility,
            0x82 => Command::ConnectB3,
            0x83 => Command::ConnectB3Active,
            0x84 => Command::DisconnectB3,
            0x86 => Command::DataB3,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Alert => "ALERT",
            Command::Connect => "CONNECT",
            Command::ConnectActive => "CONNECT_ACTIVE",
            Command::Disconnect => "DISCONNECT",
            Command::Listen => "LISTEN",
            Command::Info => "INFO",
            Command::SelectBProtocol => "SELECT_B_PROTOCOL",
            Command::Facility => "FACILITY",
            Command::ConnectB3 => "CONNECT_B3",
            Command::ConnectB3Active => "CONNECT_B3_ACTIVE",
            Command::DisconnectB3 => "DISCONNECT_B3",
            Command::DataB3 => "DATA_B3",
        }
    }
}

/// Message direction/role within a command class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Request,
    Confirmation,
    Indication,
    Response,
}

impl Kind {
    pub fn code(self) -> u8 {
        match self {
            Kind::Request => 0x80,
            Kind::Confirmation => 0x81,
            Kind::Indication => 0x82,
            Kind::Response => 0x83,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x80 => Kind::Request,
            0x81 => Kind::Confirmation,
            0x82 => Kind::Indication,
            0x83 => Kind::Response,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Request => "REQ",
            Kind::Confirmation => "CONF",
            Kind::Indication => "IND",
            Kind::Response => "RESP",
        }
    }
}

/// Negotiated bearer profile, an index into the B-protocol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BearerProfile {
    #[default]
    Transparent,
    FaxG3,
    RtpTunnel,
}

/// B1/B2/B3 protocol selection plus per-layer configuration structs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BProtocol {
    pub b1: u16,
    pub b2: u16,
    pub b3: u16,
    pub b1_config: Bytes,
    pub b2_config: Bytes,
    pub b3_config: Bytes,
}

impl BProtocol {
    /// Protocol parameter tuple for a bearer profile.
    pub fn for_profile(profile: BearerProfile) -> Self {
        match profile {
            BearerProfile::Transparent => Self {
                b1: 0x01,
                b2: 0x01,
                b3: 0x00,
                b1_config: Bytes::new(),
                b2_config: Bytes::new(),
                b3_config: Bytes::new(),
            },
            BearerProfile::FaxG3 => Self {
                b1: 0x04,
                b2: 0x04,
                b3: 0x04,
                b1_config: Bytes::new(),
                b2_config: Bytes::new(),
                b3_config: Bytes::new(),
            },
            BearerProfile::RtpTunnel => Self {
                b1: 0x1f,
                b2: 0x1f,
                b3: 0x1f,
                b1_config: Bytes::new(),
                b2_config: Bytes::from_static(&[0x01, 0x00, 0x00, 0x02]),
                b3_config: Bytes::new(),
            },
        }
    }

    /// Profile tuple with a caller-supplied B3 configuration (fax).
    pub fn with_b3_config(profile: BearerProfile, b3_config: Bytes) -> Self {
        let mut b = Self::for_profile(profile);
        b.b3_config = b3_config;
        b
    }

    fn encode(&self, w: &mut CapiWriter) {
        let mut inner = CapiWriter::new();
        inner.u16(self.b1);
        inner.u16(self.b2);
        inner.u16(self.b3);
        inner.capi_struct(&self.b1_config);
        inner.capi_struct(&self.b2_config);
        inner.capi_struct(&self.b3_config);
        w.capi_struct(&inner.freeze());
    }

    fn decode(content: &[u8]) -> Result<Option<Self>> {
        if content.is_empty() {
            return Ok(None);
        }
        let mut r = CapiReader::new(content);
        Ok(Some(Self {
            b1: r.u16()?,
            b2: r.u16()?,
            b3: r.u16()?,
            b1_config: Bytes::copy_from_slice(r.capi_struct()?),
            b2_config: Bytes::copy_from_slice(r.capi_struct()?),
            b3_config: Bytes::copy_from_slice(r.capi_struct()?),
        }))
    }
}

/// Called-party number element: numbering plan octet plus digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalledNumber {
    pub plan: u8,
    pub digits: String,
}

impl CalledNumber {
    pub fn new(digits: &str) -> Self {
        Self {
            plan: 0x80,
            digits: digits.to_string(),
        }
    }

    fn encode(&self, w: &mut CapiWriter) {
        let mut content = Vec::with_capacity(1 + self.digits.len());
        content.push(self.plan);
        content.extend_from_slice(self.digits.as_bytes());
        w.capi_struct(&content);
    }

    fn decode(content: &[u8]) -> Option<Self> {
        if content.is_empty() {
            return None;
        }
        Some(Self {
            plan: content[0],
            digits: String::from_utf8_lossy(&content[1..]).into_owned(),
        })
    }
}

/// Calling-party number element: plan, presentation, digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingNumber {
    pub plan: u8,
    pub presentation: u8,
    pub digits: String,
}

impl CallingNumber {
    pub fn new(digits: &str, plan: u8, presentation: u8) -> Self {
        Self {
            plan,
            presentation: 0x80 | (presentation & 0x63),
            digits: digits.to_string(),
        }
    }

    fn encode(&self, w: &mut CapiWriter) {
        let mut content = Vec::with_capacity(2 + self.digits.len());
        content.push(self.plan);
        content.push(self.presentation);
        content.extend_from_slice(self.digits.as_bytes());
        w.capi_struct(&content);
    }

    fn decode(content: &[u8]) -> Option<Self> {
        if content.len() < 2 {
            return None;
        }
        Some(Self {
            plan: content[0],
            presentation: content[1],
            digits: String::from_utf8_lossy(&content[2..]).into_owned(),
        })
    }
}

/// Connected-number element used in CONNECT_RESP (type + presentation + digits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedNumber {
    pub plan: u8,
    pub presentation: u8,
    pub digits: String,
}

impl ConnectedNumber {
    pub fn new(digits: &str) -> Self {
        Self {
            plan: 0x00,
            presentation: 0x80,
            digits: digits.to_string(),
        }
    }

    fn encode(&self, w: &mut CapiWriter) {
        let mut content = Vec::with_capacity(2 + self.digits.len());
        content.push(self.plan);
        content.push(self.presentation);
        content.extend_from_slice(self.digits.as_bytes());
        w.capi_struct(&content);
    }

    fn decode(content: &[u8]) -> Option<Self> {
        if content.len() < 2 {
            return None;
        }
        Some(Self {
            plan: content[0],
            presentation: content[1],
            digits: String::from_utf8_lossy(&content[2..]).into_owned(),
        })
    }
}

/// Command-specific parameter block.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    AlertReq,
    AlertConf { info: u16 },

    ConnectReq {
        cip: u16,
        called: Option<CalledNumber>,
        calling: Option<CallingNumber>,
        called_sub: Option<Bytes>,
        calling_sub: Option<Bytes>,
        b_protocol: BProtocol,
        bchannel_info: Option<Bytes>,
    },
    ConnectConf { info: u16 },
    ConnectInd {
        cip: u16,
        called: Option<CalledNumber>,
        calling: Option<CallingNumber>,
        called_sub: Option<Bytes>,
        calling_sub: Option<Bytes>,
        bchannel_info: Option<Bytes>,
    },
    ConnectResp {
        reject: u16,
        connected: Option<ConnectedNumber>,
        b_protocol: Option<BProtocol>,
    },

    ConnectActiveInd { connected: Option<CalledNumber> },
    ConnectActiveResp,

    DisconnectReq,
    DisconnectConf { info: u16 },
    DisconnectInd { reason: u16 },
    DisconnectResp,

    ListenReq { info_mask: u32, cip_mask: u32 },
    ListenConf { info: u16 },

    InfoReq { called: Option<CalledNumber> },
    InfoConf { info: u16 },
    InfoInd { info_number: u16, element: Bytes },
    InfoResp,

    SelectBProtocolReq { b_protocol: BProtocol },
    SelectBProtocolConf { info: u16 },

    FacilityReq { selector: u16, params: Bytes },
    FacilityConf { info: u16, selector: u16, params: Bytes },
    FacilityInd { selector: u16, params: Bytes },
    FacilityResp { selector: u16, params: Bytes },

    ConnectB3Req { ncpi: Option<Bytes> },
    ConnectB3Conf { info: u16 },
    ConnectB3Ind { ncpi: Option<Bytes> },
    ConnectB3Resp { reject: u16, ncpi: Option<Bytes> },

    ConnectB3ActiveInd { ncpi: Option<Bytes> },
    ConnectB3ActiveResp,

    DisconnectB3Req { ncpi: Option<Bytes> },
    DisconnectB3Conf { info: u16 },
    DisconnectB3Ind { reason_b3: u16, ncpi: Option<Bytes> },
    DisconnectB3Resp,

    DataB3Req { data: Bytes, handle: u16, flags: u16 },
    DataB3Conf { handle: u16, info: u16 },
    DataB3Ind { data: Bytes, handle: u16, flags: u16 },
    DataB3Resp { handle: u16 },
}

impl Params {
    pub fn command(&self) -> Command {
        use Params::*;
        match self {
            AlertReq | AlertConf { .. } => Command::Alert,
            ConnectReq { .. } | ConnectConf { .. } | ConnectInd { .. } | ConnectResp { .. } => {
                Command::Connect
            }
            ConnectActiveInd { .. } | ConnectActiveResp => Command::ConnectActive,
            DisconnectReq | DisconnectConf { .. } | DisconnectInd { .. } | DisconnectResp => {
                Command::Disconnect
            }
            ListenReq { .. } | ListenConf { .. } => Command::Listen,
            InfoReq { .. } | InfoConf { .. } | InfoInd { .. } | InfoResp => Command::Info,
            SelectBProtocolReq { .. } | SelectBProtocolConf { .. } => Command::SelectBProtocol,
            FacilityReq { .. } | FacilityConf { .. } | FacilityInd { .. }
            | FacilityResp { .. } => Command::Facility,
            ConnectB3Req { .. } | ConnectB3Conf { .. } | ConnectB3Ind { .. }
            | ConnectB3Resp { .. } => Command::ConnectB3,
            ConnectB3ActiveInd { .. } | ConnectB3ActiveResp => Command::ConnectB3Active,
            DisconnectB3Req { .. } | DisconnectB3Conf { .. } | DisconnectB3Ind { .. }
            | DisconnectB3Resp => Command::DisconnectB3,
            DataB3Req { .. } | DataB3Conf { .. } | DataB3Ind { .. } | DataB3Resp { .. } => {
                Command::DataB3
            }
        }
    }

    pub fn kind(&self) -> Kind {
        use Params::*;
        match self {
            AlertReq | ConnectReq { .. } | DisconnectReq | ListenReq { .. } | InfoReq { .. }
            | SelectBProtocolReq { .. } | FacilityReq { .. } | ConnectB3Req { .. }
            | DisconnectB3Req { .. } | DataB3Req { .. } => Kind::Request,
            AlertConf { .. } | ConnectConf { .. } | DisconnectConf { .. } | ListenConf { .. }
            | InfoConf { .. } | SelectBProtocolConf { .. } | FacilityConf { .. }
            | ConnectB3Conf { .. } | DisconnectB3Conf { .. } | DataB3Conf { .. } => {
                Kind::Confirmation
            }
            ConnectInd { .. } | ConnectActiveInd { .. } | DisconnectInd { .. }
            | InfoInd { .. } | FacilityInd { .. } | ConnectB3Ind { .. }
            | ConnectB3ActiveInd { .. } | DisconnectB3Ind { .. } | DataB3Ind { .. } => {
                Kind::Indication
            }
            ConnectResp { .. } | ConnectActiveResp | DisconnectResp | InfoResp
            | FacilityResp { .. } | ConnectB3Resp { .. } | ConnectB3ActiveResp
            | DisconnectB3Resp | DataB3Resp { .. } => Kind::Response,
        }
    }
}

/// One CAPI message: header fields plus typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub appl_id: u16,
    pub msg_num: u16,
    /// Controller / PLCI / NCCI address dword.
    pub cid: u32,
    pub params: Params,
}

impl Message {
    pub fn new(appl_id: u16, msg_num: u16, cid: u32, params: Params) -> Self {
        Self {
            appl_id,
            msg_num,
            cid,
            params,
        }
    }

    pub fn command(&self) -> Command {
        self.params.command()
    }

    pub fn kind(&self) -> Kind {
        self.params.kind()
    }

    /// "CONNECT_B3_IND" style label for the logs.
    pub fn label(&self) -> String {
        format!("{}_{}", self.command().name(), self.kind().name())
    }

    /// PLCI portion of the address dword (controller in the low octet).
    pub fn plci(&self) -> u32 {
        self.cid & 0xffff
    }

    pub fn encode(&self) -> Bytes {
        let mut w = CapiWriter::new();
        // header, length patched below
        w.u16(0);
        w.u16(self.appl_id);
        w.u8(self.command().code());
        w.u8(self.kind().code());
        w.u16(self.msg_num);
        w.u32(self.cid);
        self.encode_params(&mut w);

        let mut buf = w.freeze().to_vec();
        let total = buf.len() as u16;
        buf[0..2].copy_from_slice(&total.to_le_bytes());
        Bytes::from(buf)
    }

    fn encode_params(&self, w: &mut CapiWriter) {
        use Params::*;
        match &self.params {
            AlertReq => {
                w.empty_struct(); // additional info
            }
            AlertConf { info }
            | ConnectConf { info }
            | DisconnectConf { info }
            | ListenConf { info }
            | InfoConf { info }
            | SelectBProtocolConf { info }
            | ConnectB3Conf { info }
            | DisconnectB3Conf { info } => {
                w.u16(*info);
            }
            ConnectReq {
                cip,
                called,
                calling,
                called_sub,
                calling_sub,
                b_protocol,
                bchannel_info,
            } => {
                w.u16(*cip);
                encode_opt_called(w, called);
                encode_opt_calling(w, calling);
                encode_opt_bytes(w, called_sub);
                encode_opt_bytes(w, calling_sub);
                b_protocol.encode(w);
                encode_opt_bytes(w, bchannel_info);
            }
            ConnectInd {
                cip,
                called,
                calling,
                called_sub,
                calling_sub,
                bchannel_info,
            } => {
                w.u16(*cip);
                encode_opt_called(w, called);
                encode_opt_calling(w, calling);
                encode_opt_bytes(w, called_sub);
                encode_opt_bytes(w, calling_sub);
                encode_opt_bytes(w, bchannel_info);
            }
            ConnectResp {
                reject,
                connected,
                b_protocol,
            } => {
                w.u16(*reject);
                match connected {
                    Some(n) => n.encode(w),
                    None => w.empty_struct(),
                }
                match b_protocol {
                    Some(b) => b.encode(w),
                    None => w.empty_struct(),
                }
            }
            ConnectActiveInd { connected } => {
                encode_opt_called(w, connected);
            }
            ConnectActiveResp | DisconnectResp | InfoResp | ConnectB3ActiveResp
            | DisconnectB3Resp => {}
            DisconnectReq => {
                w.empty_struct(); // additional info
            }
            DisconnectInd { reason } => {
                w.u16(*reason);
            }
            ListenReq {
                info_mask,
                cip_mask,
            } => {
                w.u32(*info_mask);
                w.u32(*cip_mask);
            }
            InfoReq { called } => {
                encode_opt_called(w, called);
                w.empty_struct(); // additional info
            }
            InfoInd {
                info_number,
                element,
            } => {
                w.u16(*info_number);
                w.capi_struct(element);
            }
            SelectBProtocolReq { b_protocol } => {
                b_protocol.encode(w);
            }
            FacilityReq { selector, params }
            | FacilityInd { selector, params }
            | FacilityResp { selector, params } => {
                w.u16(*selector);
                w.capi_struct(params);
            }
            FacilityConf {
                info,
                selector,
                params,
            } => {
                w.u16(*info);
                w.u16(*selector);
                w.capi_struct(params);
            }
            ConnectB3Req { ncpi } | ConnectB3Ind { ncpi } | ConnectB3ActiveInd { ncpi }
            | DisconnectB3Req { ncpi } => {
                encode_opt_bytes(w, ncpi);
            }
            ConnectB3Resp { reject, ncpi } => {
                w.u16(*reject);
                encode_opt_bytes(w, ncpi);
            }
            DisconnectB3Ind { reason_b3, ncpi } => {
                w.u16(*reason_b3);
                encode_opt_bytes(w, ncpi);
            }
            DataB3Req { data, handle, flags } | DataB3Ind { data, handle, flags } => {
                w.u16(data.len() as u16);
                w.u16(*handle);
                w.u16(*flags);
                w.raw(data);
            }
            DataB3Conf { handle, info } => {
                w.u16(*handle);
                w.u16(*info);
            }
            DataB3Resp { handle } => {
                w.u16(*handle);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + 4 {
            return Err(Error::protocol(format!(
                "message too short: {} octets",
                buf.len()
            )));
        }
        let declared = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if declared > buf.len() {
            return Err(Error::protocol(format!(
                "declared length {} exceeds buffer {}",
                declared,
                buf.len()
            )));
        }
        // never look past the declared outer length
        let mut r = CapiReader::new(&buf[..declared]);
        let _total = r.u16()?;
        let appl_id = r.u16()?;
        let cmd_code = r.u8()?;
        let kind_code = r.u8()?;
        let msg_num = r.u16()?;
        let cid = r.u32()?;

        let command = Command::from_code(cmd_code)
            .ok_or_else(|| Error::protocol(format!("unknown command 0x{:02x}", cmd_code)))?;
        let kind = Kind::from_code(kind_code)
            .ok_or_else(|| Error::protocol(format!("unknown subcommand 0x{:02x}", kind_code)))?;

        let params = Self::decode_params(command, kind, &mut r)?;
        Ok(Self {
            appl_id,
            msg_num,
            cid,
            params,
        })
    }

    fn decode_params(command: Command, kind: Kind, r: &mut CapiReader) -> Result<Params> {
        let params = match (command, kind) {
            (Command::Alert, Kind::Request) => Params::AlertReq,
            (Command::Alert, Kind::Confirmation) => Params::AlertConf { info: r.u16()? },

            (Command::Connect, Kind::Request) => Params::ConnectReq {
                cip: r.u16()?,
                called: CalledNumber::decode(r.capi_struct()?),
                calling: CallingNumber::decode(r.capi_struct()?),
                called_sub: decode_opt_bytes(r)?,
                calling_sub: decode_opt_bytes(r)?,
                b_protocol: BProtocol::decode(r.capi_struct()?)?
                    .unwrap_or_else(|| BProtocol::for_profile(BearerProfile::Transparent)),
                bchannel_info: decode_opt_bytes(r)?,
            },
            (Command::Connect, Kind::Confirmation) => Params::ConnectConf { info: r.u16()? },
            (Command::Connect, Kind::Indication) => Params::ConnectInd {
                cip: r.u16()?,
                called: CalledNumber::decode(r.capi_struct()?),
                calling: CallingNumber::decode(r.capi_struct()?),
                called_sub: decode_opt_bytes(r)?,
                calling_sub: decode_opt_bytes(r)?,
                bchannel_info: decode_opt_bytes(r)?,
            },
            (Command::Connect, Kind::Response) => Params::ConnectResp {
                reject: r.u16()?,
                connected: ConnectedNumber::decode(r.capi_struct()?),
                b_protocol: BProtocol::decode(r.capi_struct()?)?,
            },

            (Command::ConnectActive, Kind::Indication) => Params::ConnectActiveInd {
                connected: CalledNumber::decode(r.capi_struct()?),
            },
            (Command::ConnectActive, Kind::Response) => Params::ConnectActiveResp,

            (Command::Disconnect, Kind::Request) => Params::DisconnectReq,
            (Command::Disconnect, Kind::Confirmation) => {
                Params::DisconnectConf { info: r.u16()? }
            }
            (Command::Disconnect, Kind::Indication) => {
                Params::DisconnectInd { reason: r.u16()? }
            }
            (Command::Disconnect, Kind::Response) => Params::DisconnectResp,

            (Command::Listen, Kind::Request) => Params::ListenReq {
                info_mask: r.u32()?,
                cip_mask: r.u32()?,
            },
            (Command::Listen, Kind::Confirmation) => Params::ListenConf { info: r.u16()? },

            (Command::Info, Kind::Request) => Params::InfoReq {
                called: CalledNumber::decode(r.capi_struct()?),
            },
            (Command::Info, Kind::Confirmation) => Params::InfoConf { info: r.u16()? },
            (Command::Info, Kind::Indication) => Params::InfoInd {
                info_number: r.u16()?,
                element: Bytes::copy_from_slice(r.capi_struct()?),
            },
            (Command::Info, Kind::Response) => Params::InfoResp,

            (Command::SelectBProtocol, Kind::Request) => Params::SelectBProtocolReq {
                b_protocol: BProtocol::decode(r.capi_struct()?)?
                    .unwrap_or_else(|| BProtocol::for_profile(BearerProfile::Transparent)),
            },
            (Command::SelectBProtocol, Kind::Confirmation) => {
                Params::SelectBProtocolConf { info: r.u16()? }
            }

            (Command::Facility, Kind::Request) => Params::FacilityReq {
                selector: r.u16()?,
                params: Bytes::copy_from_slice(r.capi_struct()?),
            },
            (Command::Facility, Kind::Confirmation) => Params::FacilityConf {
                info: r.u16()?,
                selector: r.u16()?,
                params: Bytes::copy_from_slice(r.capi_struct()?),
            },
            (Command::Facility, Kind::Indication) => Params::FacilityInd {
                selector: r.u16()?,
                params: Bytes::copy_from_slice(r.capi_struct()?),
            },
            (Command::Facility, Kind::Response) => Params::FacilityResp {
                selector: r.u16()?,
                params: Bytes::copy_from_slice(r.capi_struct()?),
            },

            (Command::ConnectB3, Kind::Request) => Params::ConnectB3Req {
                ncpi: decode_opt_bytes(r)?,
            },
            (Command::ConnectB3, Kind::Confirmation) => {
                Params::ConnectB3Conf { info: r.u16()? }
            }
            (Command::ConnectB3, Kind::Indication) => Params::ConnectB3Ind {
                ncpi: decode_opt_bytes(r)?,
            },
            (Command::ConnectB3, Kind::Response) => Params::ConnectB3Resp {
                reject: r.u16()?,
                ncpi: decode_opt_bytes(r)?,
            },

            (Command::ConnectB3Active, Kind::Indication) => Params::ConnectB3ActiveInd {
                ncpi: decode_opt_bytes(r)?,
            },
            (Command::ConnectB3Active, Kind::Response) => Params::ConnectB3ActiveResp,

            (Command::DisconnectB3, Kind::Request) => Params::DisconnectB3Req {
                ncpi: decode_opt_bytes(r)?,
            },
            (Command::DisconnectB3, Kind::Confirmation) => {
                Params::DisconnectB3Conf { info: r.u16()? }
            }
            (Command::DisconnectB3, Kind::Indication) => Params::DisconnectB3Ind {
                reason_b3: r.u16()?,
                ncpi: decode_opt_bytes(r)?,
            },
            (Command::DisconnectB3, Kind::Response) => Params::DisconnectB3Resp,

            (Command::DataB3, Kind::Request) | (Command::DataB3, Kind::Indication) => {
                let len = r.u16()? as usize;
                let handle = r.u16()?;
                let flags = r.u16()?;
                let data = Bytes::copy_from_slice(r.take(len)?);
                if kind == Kind::Request {
                    Params::DataB3Req { data, handle, flags }
                } else {
                    Params::DataB3Ind { data, handle, flags }
                }
            }
            (Command::DataB3, Kind::Confirmation) => Params::DataB3Conf {
                handle: r.u16()?,
                info: r.u16()?,
            },
            (Command::DataB3, Kind::Response) => Params::DataB3Resp { handle: r.u16()? },

            (command, kind) => {
                return Err(Error::protocol(format!(
                    "unsupported message {}_{}",
                    command.name(),
                    kind.name()
                )))
            }
        };
        Ok(params)
    }
}

fn encode_opt_called(w: &mut CapiWriter, n: &Option<CalledNumber>) {
    match n {
        Some(n) => n.encode(w),
        None => w.empty_struct(),
    }
}

fn encode_opt_calling(w: &mut CapiWriter, n: &Option<CallingNumber>) {
    match n {
        Some(n) => n.encode(w),
        None => w.empty_struct(),
    }
}

fn encode_opt_bytes(w: &mut CapiWriter, b: &Option<Bytes>) {
    match b {
        Some(b) => w.capi_struct(b),
        None => w.empty_struct(),
    }
}

fn decode_opt_bytes(r: &mut CapiReader) -> Result<Option<Bytes>> {
    let content = r.capi_struct()?;
    if content.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Bytes::copy_from_slice(content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_req_round_trip() {
        let msg = Message::new(
            1,
            0x1234,
            0x0000_0001,
            Params::ConnectReq {
                cip: 0x10,
                called: Some(CalledNumber::new("4321")),
                calling: Some(CallingNumber::new("800", 0x00, 0x00)),
                called_sub: None,
                calling_sub: None,
                b_protocol: BProtocol::for_profile(BearerProfile::Transparent),
                bchannel_info: Some(Bytes::from_static(&[0x00, 0x00])),
            },
        );
        let wire = msg.encode();
        assert_eq!(
            u16::from_le_bytes([wire[0], wire[1]]) as usize,
            wire.len()
        );
        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_long_element_uses_length_escape() {
        let digits = "9".repeat(400);
        let msg = Message::new(
            1,
            7,
            0x0101,
            Params::InfoInd {
                info_number: 0x0070,
                element: Bytes::from(digits.into_bytes()),
            },
        );
        let wire = msg.encode();
        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_data_b3_round_trip() {
        let payload = Bytes::from_static(&[0x55u8; 160]);
        let msg = Message::new(
            1,
            99,
            0x0001_0101,
            Params::DataB3Ind {
                data: payload.clone(),
                handle: 3,
                flags: 0,
            },
        );
        let wire = msg.encode();
        let decoded = Message::decode(&wire).unwrap();
        match decoded.params {
            Params::DataB3Ind { data, handle, .. } => {
                assert_eq!(data, payload);
                assert_eq!(handle, 3);
            }
            other => panic!("unexpected params {:?}", other),
        }
    }

    #[test]
    fn test_rtp_profile_round_trip() {
        let msg = Message::new(
            1,
            2,
            0x0101,
            Params::SelectBProtocolReq {
                b_protocol: BProtocol::for_profile(BearerProfile::RtpTunnel),
            },
        );
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_truncated_message_fails_closed() {
        let msg = Message::new(
            1,
            5,
            0x0101,
            Params::DisconnectInd { reason: 0x3490 },
        );
        let wire = msg.encode();
        // cut into the parameter area
        assert!(Message::decode(&wire[..wire.len() - 1]).is_err());
        // header shorter than the fixed part
        assert!(Message::decode(&wire[..6]).is_err());
    }

    #[test]
    fn test_declared_length_beyond_buffer_rejected() {
        let msg = Message::new(1, 5, 0x0101, Params::AlertReq);
        let mut wire = msg.encode().to_vec();
        wire[0] = 0xff;
        wire[1] = 0x00;
        assert!(Message::decode(&wire).is_err());
    }

    #[test]
    fn test_data_b3_length_field_checked() {
        let msg = Message::new(
            1,
            5,
            0x0101,
            Params::DataB3Ind {
                data: Bytes::from_static(b"abcd"),
                handle: 0,
                flags: 0,
            },
        );
        let mut wire = msg.encode().to_vec();
        // claim more payload than the message carries
        wire[12] = 0xff;
        wire[13] = 0x00;
        assert!(Message::decode(&wire).is_err());
    }
}

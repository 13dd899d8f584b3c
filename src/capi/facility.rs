//! Facility message payloads
//!
//! FACILITY is the generic envelope for supplementary services, DTMF
//! control, the adapter echo canceller and line interconnect. These
//! builders and parsers cover the payload that travels after the
//! facility selector.

use bytes::Bytes;

use crate::capi::codec::{CapiReader, CapiWriter};
use crate::Result;

/// Supplementary service functions.
pub const SUPPL_GET_SUPPORTED: u16 = 0x0000;
pub const SUPPL_HOLD: u16 = 0x0002;
pub const SUPPL_RETRIEVE: u16 = 0x0003;
pub const SUPPL_ECT: u16 = 0x0006;
pub const SUPPL_CALL_DEFLECTION: u16 = 0x000d;
pub const SUPPL_MCID: u16 = 0x000e;

/// DTMF facility functions.
pub const DTMF_LISTEN_START: u16 = 1;
pub const DTMF_LISTEN_STOP: u16 = 2;
pub const DTMF_SEND: u16 = 3;

/// Tone and gap duration for sent digits, milliseconds.
pub const DTMF_DURATION: u16 = 0x40;

/// Echo canceller functions.
pub const EC_ENABLE: u16 = 1;
pub const EC_DISABLE: u16 = 2;

/// Line interconnect functions.
pub const LI_CONNECT: u16 = 0x0001;
pub const LI_DISCONNECT: u16 = 0x0002;

/// Supplementary request with an empty parameter struct
/// (hold, retrieve, MCID, the supported-services query).
pub fn supplementary_simple(function: u16) -> Bytes {
    let mut w = CapiWriter::new();
    w.u16(function);
    w.empty_struct();
    w.freeze()
}

/// Explicit call transfer naming the linked (held) PLCI.
pub fn supplementary_ect(plci: u32) -> Bytes {
    let mut w = CapiWriter::new();
    w.u16(SUPPL_ECT);
    let mut inner = CapiWriter::new();
    inner.u32(plci);
    w.capi_struct(&inner.freeze());
    w.freeze()
}

/// Parsed supplementary confirmation.
#[derive(Debug, Clone, Copy)]
pub struct SupplementaryConf {
    pub function: u16,
    pub info: u16,
    pub services: Option<u32>,
}

pub fn parse_supplementary_conf(params: &[u8]) -> Result<SupplementaryConf> {
    let mut r = CapiReader::new(params);
    let function = r.u16()?;
    let inner = r.capi_struct()?;
    let mut ri = CapiReader::new(inner);
    let info = if inner.len() >= 2 { ri.u16()? } else { 0 };
    let services = if inner.len() >= 6 { Some(ri.u32()?) } else { None };
    Ok(SupplementaryConf {
        function,
        info,
        services,
    })
}

/// Parsed supplementary indication (hold/retrieve/ECT results).
#[derive(Debug, Clone, Copy)]
pub struct SupplementaryInd {
    pub function: u16,
    pub reason: u16,
}

pub fn parse_supplementary_ind(params: &[u8]) -> Result<SupplementaryInd> {
    let mut r = CapiReader::new(params);
    let function = r.u16()?;
    let inner = r.capi_struct()?;
    let reason = if inner.len() >= 2 {
        u16::from_le_bytes([inner[0], inner[1]])
    } else {
        0
    };
    Ok(SupplementaryInd { function, reason })
}

/// Build a supplementary indication/confirmation payload (adapter side,
/// used by the simulated transport and the tests).
pub fn supplementary_result(function: u16, reason: u16) -> Bytes {
    let mut w = CapiWriter::new();
    w.u16(function);
    let mut inner = CapiWriter::new();
    inner.u16(reason);
    w.capi_struct(&inner.freeze());
    w.freeze()
}

/// Start or stop the adapter DTMF detector.
pub fn dtmf_listen(start: bool) -> Bytes {
    let mut w = CapiWriter::new();
    w.u16(if start { DTMF_LISTEN_START } else { DTMF_LISTEN_STOP });
    w.u16(DTMF_DURATION);
    w.u16(DTMF_DURATION);
    w.empty_struct();
    w.u8(0);
    w.freeze()
}

/// Send one DTMF digit on the connection.
pub fn dtmf_send(digit: char) -> Bytes {
    let mut w = CapiWriter::new();
    w.u16(DTMF_SEND);
    w.u16(DTMF_DURATION);
    w.u16(DTMF_DURATION);
    w.capi_struct(&[digit as u8]);
    w.freeze()
}

/// Digit list of a DTMF facility indication.
pub fn parse_dtmf_digits(params: &[u8]) -> Result<Vec<u8>> {
    let mut r = CapiReader::new(params);
    Ok(r.capi_struct()?.to_vec())
}

/// Build a DTMF indication payload (adapter side).
pub fn dtmf_indication(digits: &[u8]) -> Bytes {
    let mut w = CapiWriter::new();
    w.capi_struct(digits);
    w.freeze()
}

/// Echo canceller control. Enable carries the option bits and tail
/// length; the remaining word is the pre-delay, left at the default.
pub fn echo_cancel(function: u16, option: u16, tail: u16) -> Bytes {
    let mut w = CapiWriter::new();
    w.u16(function);
    if function == EC_ENABLE {
        let mut inner = CapiWriter::new();
        inner.u16(option);
        inner.u16(tail);
        inner.u16(0);
        w.capi_struct(&inner.freeze());
    } else {
        w.empty_struct();
    }
    w.freeze()
}

pub fn parse_echo_cancel_conf(params: &[u8]) -> Result<u16> {
    let mut r = CapiReader::new(params);
    r.u16()
}

/// Join the media of two calls inside the adapter.
pub fn line_interconnect_connect(peer_plci: u32) -> Bytes {
    let mut w = CapiWriter::new();
    w.u16(LI_CONNECT);
    let mut request = CapiWriter::new();
    request.u32(0); // data path: both directions through the adapter
    let mut participants = CapiWriter::new();
    let mut participant = CapiWriter::new();
    participant.u32(peer_plci);
    participant.u32(0x0000_0003); // participant data path
    participants.capi_struct(&participant.freeze());
    request.capi_struct(&participants.freeze());
    w.capi_struct(&request.freeze());
    w.freeze()
}

pub fn line_interconnect_disconnect(peer_plci: u32) -> Bytes {
    let mut w = CapiWriter::new();
    w.u16(LI_DISCONNECT);
    let mut inner = CapiWriter::new();
    inner.u32(peer_plci);
    w.capi_struct(&inner.freeze());
    w.freeze()
}

pub fn parse_line_interconnect_function(params: &[u8]) -> Result<u16> {
    let mut r = CapiReader::new(params);
    r.u16()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_supplementary_layout() {
        let p = supplementary_simple(SUPPL_HOLD);
        assert_eq!(&p[..], &[0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_ect_carries_plci() {
        let p = supplementary_ect(0x0000_0201);
        assert_eq!(&p[..], &[0x06, 0x00, 0x04, 0x01, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_supplementary_result_round_trip() {
        let p = supplementary_result(SUPPL_RETRIEVE, 0);
        let parsed = parse_supplementary_ind(&p).unwrap();
        assert_eq!(parsed.function, SUPPL_RETRIEVE);
        assert_eq!(parsed.reason, 0);
    }

    #[test]
    fn test_dtmf_listen_is_eight_octets() {
        assert_eq!(dtmf_listen(true).len(), 8);
        assert_eq!(dtmf_listen(false)[0], DTMF_LISTEN_STOP as u8);
    }

    #[test]
    fn test_dtmf_digits_round_trip() {
        let p = dtmf_indication(b"15#");
        assert_eq!(parse_dtmf_digits(&p).unwrap(), b"15#".to_vec());
    }

    #[test]
    fn test_dtmf_long_digit_list_uses_escape() {
        let digits = vec![b'5'; 300];
        let p = dtmf_indication(&digits);
        assert_eq!(p[0], 0xff);
        assert_eq!(parse_dtmf_digits(&p).unwrap(), digits);
    }

    #[test]
    fn test_echo_cancel_enable_layout() {
        let p = echo_cancel(EC_ENABLE, 0x0004, 64);
        assert_eq!(&p[..], &[0x01, 0x00, 0x06, 0x04, 0x00, 0x40, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_line_interconnect_nesting() {
        let p = line_interconnect_connect(0x0301);
        let function = parse_line_interconnect_function(&p).unwrap();
        assert_eq!(function, LI_CONNECT);
        // function word + one nested request struct
        assert_eq!(p.len(), 2 + 1 + 4 + 1 + 1 + 8);
    }

    #[test]
    fn test_truncated_supplementary_fails_closed() {
        assert!(parse_supplementary_conf(&[0x02]).is_err());
        assert!(parse_dtmf_digits(&[0x05, b'1']).is_err());
    }
}

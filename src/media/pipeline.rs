//! Voice path: reframing, flow control and echo suppression
//!
//! Outbound audio arrives from the host in arbitrary frame sizes and
//! must leave as exact transport blocks, each consuming one unit of the
//! bounded in-flight credit the adapter grants. The echo suppressor is
//! a rolling-average heuristic: when recent transmit energy clearly
//! exceeds receive energy, the received block is very likely our own
//! echo and is replaced with companded silence.

use bytes::{Bytes, BytesMut};

use crate::media::companding::{Gains, Law, REVERSE_BITS};

/// Fixed transport block size on the B channel.
pub const B3_BLOCK_SIZE: usize = 160;

/// In-flight data blocks the adapter accepts per connection.
pub const B3_BLOCK_WINDOW: usize = 7;

/// Transmit-energy history length.
pub const ECHO_TX_WINDOW: usize = 5;

/// Oldest entries of the history considered, compensating for the
/// round-trip delay of the echo.
pub const ECHO_EFFECTIVE_TX_WINDOW: usize = 3;

/// Suppress when tx average divided by this exceeds the rx average.
pub const ECHO_TXRX_RATIO: f32 = 2.3;

/// Accumulates outbound audio and emits exact transport blocks.
#[derive(Debug)]
pub struct Reframer {
    block_size: usize,
    buf: BytesMut,
}

impl Reframer {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            buf: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_block(&mut self) -> Option<Bytes> {
        if self.buf.len() < self.block_size {
            return None;
        }
        Some(self.buf.split_to(self.block_size).freeze())
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Bounded counter of data blocks permitted in flight.
#[derive(Debug)]
pub struct FlowControl {
    window: usize,
    credit: usize,
}

impl FlowControl {
    pub fn new(window: usize) -> Self {
        Self { window, credit: 0 }
    }

    /// Grant the full window, at bearer establishment.
    pub fn grant(&mut self) {
        self.credit = self.window;
    }

    pub fn revoke(&mut self) {
        self.credit = 0;
    }

    /// Take one credit for an outbound block.
    pub fn try_consume(&mut self) -> bool {
        if self.credit == 0 {
            return false;
        }
        self.credit -= 1;
        true
    }

    /// One outbound-data confirmation returns exactly one credit.
    pub fn replenish(&mut self) {
        if self.credit < self.window {
            self.credit += 1;
        }
    }

    pub fn credit(&self) -> usize {
        self.credit
    }

    pub fn in_flight(&self) -> usize {
        self.window - self.credit
    }
}

/// Rolling-average echo suppression state.
#[derive(Debug)]
pub struct EchoSuppressor {
    history: [i32; ECHO_TX_WINDOW],
    effective: usize,
    ratio: f32,
}

impl EchoSuppressor {
    pub fn new(effective: usize, ratio: f32) -> Self {
        Self {
            history: [0; ECHO_TX_WINDOW],
            effective: effective.min(ECHO_TX_WINDOW).max(1),
            ratio,
        }
    }

    pub fn reset(&mut self) {
        self.history = [0; ECHO_TX_WINDOW];
    }

    /// Record the mean magnitude of one transmitted block.
    pub fn record_tx(&mut self, law: Law, block: &[u8]) {
        if block.is_empty() {
            return;
        }
        let sum: i64 = block
            .iter()
            .map(|&b| (law.decode(b) as i64).abs())
            .sum();
        let avg = (sum / block.len() as i64) as i32;
        self.history.rotate_left(1);
        self.history[ECHO_TX_WINDOW - 1] = avg;
    }

    /// Mean over the oldest `effective` transmit averages.
    pub fn tx_average(&self) -> i32 {
        let sum: i64 = self.history[..self.effective].iter().map(|&v| v as i64).sum();
        (sum / self.effective as i64) as i32
    }

    /// Strictly greater-than: a receive average exactly at the threshold
    /// does not suppress.
    pub fn should_suppress(&self, rx_average: i32) -> bool {
        (self.tx_average() as f32 / self.ratio) > rx_average as f32
    }
}

/// Per-call voice state: reframer, credit, gain and echo suppression.
#[derive(Debug)]
pub struct VoicePath {
    pub law: Law,
    pub gains: Gains,
    pub echo_squelch: bool,
    pub reframer: Reframer,
    pub flow: FlowControl,
    pub echo: EchoSuppressor,
}

impl VoicePath {
    pub fn new(law: Law, gains: Gains, echo_squelch: bool, effective: usize, ratio: f32) -> Self {
        Self {
            law,
            gains,
            echo_squelch,
            reframer: Reframer::new(B3_BLOCK_SIZE),
            flow: FlowControl::new(B3_BLOCK_WINDOW),
            echo: EchoSuppressor::new(effective, ratio),
        }
    }

    pub fn reset(&mut self) {
        self.reframer.reset();
        self.flow.revoke();
        self.echo.reset();
    }

    /// Host-order block to wire order, recording echo state or applying
    /// transmit gain.
    pub fn outbound_block(&mut self, block: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(block.len());
        if self.echo_squelch {
            self.echo.record_tx(self.law, block);
            for &b in block {
                out.extend_from_slice(&[REVERSE_BITS[b as usize]]);
            }
        } else {
            for &b in block {
                out.extend_from_slice(&[REVERSE_BITS[self.gains.apply_tx(b) as usize]]);
            }
        }
        out.freeze()
    }

    /// Wire-order block to host order; returns the block and whether it
    /// was replaced by silence.
    pub fn inbound_block(&mut self, data: &[u8]) -> (Bytes, bool) {
        let mut out = BytesMut::with_capacity(data.len());
        if self.echo_squelch {
            let mut sum: i64 = 0;
            for &b in data {
                let host = REVERSE_BITS[b as usize];
                sum += (self.law.decode(host) as i64).abs();
                out.extend_from_slice(&[host]);
            }
            let rx_average = if data.is_empty() {
                0
            } else {
                (sum / data.len() as i64) as i32
            };
            if self.echo.should_suppress(rx_average) {
                let silence = self.law.silence();
                out.iter_mut().for_each(|b| *b = silence);
                return (out.freeze(), true);
            }
            (out.freeze(), false)
        } else {
            for &b in data {
                out.extend_from_slice(&[self.gains.apply_rx(REVERSE_BITS[b as usize])]);
            }
            (out.freeze(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reframer_emits_exact_blocks() {
        let mut r = Reframer::new(B3_BLOCK_SIZE);
        r.feed(&[0u8; 100]);
        assert!(r.next_block().is_none());
        r.feed(&[0u8; 100]);
        let block = r.next_block().expect("one block");
        assert_eq!(block.len(), B3_BLOCK_SIZE);
        assert!(r.next_block().is_none());
        assert_eq!(r.pending(), 40);
    }

    #[test]
    fn test_flow_credit_bounds() {
        let mut f = FlowControl::new(B3_BLOCK_WINDOW);
        assert!(!f.try_consume(), "no credit before grant");
        f.grant();
        for _ in 0..B3_BLOCK_WINDOW {
            assert!(f.try_consume());
        }
        assert!(!f.try_consume(), "window exhausted");
        f.replenish();
        assert_eq!(f.credit(), 1);
        // confirmations never push the credit above the window
        for _ in 0..20 {
            f.replenish();
        }
        assert_eq!(f.credit(), B3_BLOCK_WINDOW);
    }

    #[test]
    fn test_echo_threshold_is_strictly_greater() {
        let mut e = EchoSuppressor::new(ECHO_EFFECTIVE_TX_WINDOW, 2.0);
        // fill the effective window with a constant transmit average
        let loud = vec![Law::ULaw.encode(8000); 160];
        for _ in 0..ECHO_TX_WINDOW {
            e.record_tx(Law::ULaw, &loud);
        }
        let tx = e.tx_average();
        let boundary = (tx as f32 / 2.0) as i32;
        assert!(!e.should_suppress(boundary), "exact threshold must pass");
        assert!(e.should_suppress(boundary - 1), "one unit below suppresses");
    }

    #[test]
    fn test_inbound_suppression_writes_silence() {
        let mut v = VoicePath::new(Law::ALaw, Gains::unity(), true, ECHO_EFFECTIVE_TX_WINDOW, 2.3);
        let loud = vec![Law::ALaw.encode(12000); B3_BLOCK_SIZE];
        for _ in 0..ECHO_TX_WINDOW {
            v.outbound_block(&loud);
        }
        // a very quiet receive block while transmitting loudly is echo
        let quiet_wire: Vec<u8> =
            vec![REVERSE_BITS[Law::ALaw.encode(10) as usize]; B3_BLOCK_SIZE];
        let (block, suppressed) = v.inbound_block(&quiet_wire);
        assert!(suppressed);
        assert!(block.iter().all(|&b| b == Law::ALaw.silence()));
    }

    #[test]
    fn test_round_trip_through_voice_path_without_squelch() {
        let mut v = VoicePath::new(Law::ALaw, Gains::unity(), false, ECHO_EFFECTIVE_TX_WINDOW, 2.3);
        let host: Vec<u8> = (0..=159u8).collect();
        let wire = v.outbound_block(&host);
        let (back, suppressed) = v.inbound_block(&wire);
        assert!(!suppressed);
        assert_eq!(&back[..], &host[..]);
    }
}

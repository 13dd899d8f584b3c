//! Voice-path media processing: companding, gain, reframing, echo
//! suppression and outbound flow control.

pub mod companding;
pub mod pipeline;

pub use companding::{Gains, Law, REVERSE_BITS};
pub use pipeline::{
    EchoSuppressor, FlowControl, Reframer, VoicePath, B3_BLOCK_SIZE, B3_BLOCK_WINDOW,
    ECHO_EFFECTIVE_TX_WINDOW, ECHO_TXRX_RATIO, ECHO_TX_WINDOW,
};

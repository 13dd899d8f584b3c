//! CAPI 2.0 protocol layer: wire codec, message set, facility payloads
//! and the adapter transport boundary.

pub mod codec;
pub mod facility;
pub mod msg;
pub mod transport;

pub use msg::{BearerProfile, Command, Kind, Message, Params};
pub use transport::{ApplId, CapiTransport, ControllerProfile, RegisterParams, SimulatedTransport};

//! Engine core: call records, registries and the dispatch loop.

pub mod call;
pub mod engine;
pub mod registry;

pub use call::{CallFrame, CallState, ControlEvent, EarlyB3, Line, LineStatus};
pub use engine::{
    AcceptAll, CallHandle, CallRouter, CapiEngine, DialOptions, IncomingCall, LineSelector,
    RouteDecision,
};
pub use registry::{CallRegistry, ControllerInfo, ControllerTable};

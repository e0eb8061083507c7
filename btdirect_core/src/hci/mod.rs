//! Raw HCI: wire types and the event engine bound to one adapter.

mod engine;
mod types;

pub use engine::{
    HciConfig, HciEngine, HciError, HciHandle, HciInternalError, HciTransport, LocalVersion,
};
pub use types::*;

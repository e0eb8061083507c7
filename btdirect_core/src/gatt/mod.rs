//! GATT: the discovered service/characteristic/descriptor forest and the
//! client engine driving ATT over one L2CAP channel per peer.

mod engine;
mod tree;

pub use engine::{
    AttBearer, AttConnState, GattConfig, GattEngine, GattError, GattEventListener, GattHandle,
    GattInternalError,
};
pub use tree::*;

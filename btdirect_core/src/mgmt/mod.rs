//! Kernel Bluetooth management (MGMT) control channel: wire types and the
//! adapter configuration/discovery client.

mod client;
mod types;

pub use client::{MgmtClient, MgmtConfig, MgmtError, MgmtHandle, MgmtInternalError, MgmtReply, MgmtTransport};
pub use types::*;

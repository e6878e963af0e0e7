//! RPC surface for operator and companion-process communication.
//!
//! - `protocol`: wire message types, method names, error codes
//! - `commands`: typed payloads carried inside params/result strings
//! - `peer`: per-connection session state owned by the daemon loop
//! - `client`: connecting side, used by the stop CLI and tests

pub mod client;
pub mod commands;
pub mod peer;
pub mod protocol;

pub use client::{ClientError, RpcClient};
pub use peer::{PeerId, PeerSession};
pub use protocol::{Request, Response, RpcError, RpcMessage};

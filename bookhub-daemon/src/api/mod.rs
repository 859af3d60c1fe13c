//! JSON-RPC API for daemon IPC.
//!
//! Book sites reach the hub through this interface: line-delimited
//! JSON-RPC 2.0 over a Unix socket, one named-object params value per call.

pub mod handlers;
pub mod server;
pub mod types;

pub use handlers::{ApiState, BookhubApiImpl, BookhubApiServer, rpc_error};
pub use server::{ServerHandle, start_server};
pub use types::*;

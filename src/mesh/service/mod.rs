//! C9: service subsystem. One caller per outbound request, one handler
//! registry for inbound requests this node can serve.

pub mod caller;
pub mod handler;
pub mod types;

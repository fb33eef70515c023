//! C8: topic subsystem. Sender, listener registry + inbound dispatch.
//! `wait_for_listener`/`depends_on_listener` live on `Node` (C11), since
//! both need to call back into the node's own `listen`/`stop_listening`.

pub mod listener;
pub mod sender;
pub mod types;

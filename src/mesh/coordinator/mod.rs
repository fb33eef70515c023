//! C10: the coordinator. A small rendezvous service nodes register with to
//! discover each other; it owns no data-plane traffic (topics/services go
//! node-to-node, see `mesh::peer`/`mesh::topic`/`mesh::service`) — only
//! identity, reachability, and liveness bookkeeping.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::CoordinatorClient;
pub use protocol::{CoordinatorMessage, CoordinatorRequestBody, CoordinatorResponseBody};
pub use server::CoordinatorServer;

//! `roselet-mesh`: a peer-to-peer publish/subscribe and request/response
//! message mesh. A coordinator (`coordinator`) handles discovery only;
//! topic and service traffic flow directly node-to-node (`peer`,
//! `topic`, `service`) over a pluggable transport (`transport`) secured by
//! a pluggable handshake (`auth`) and framed by a small binary codec
//! (`codec`). `node` wires all of the above into the public API.

pub mod auth;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod loadbalancing;
pub mod node;
pub mod peer;
pub mod service;
pub mod specs;
pub mod topic;
pub mod topology;
pub mod transport;

pub use config::MeshConfig;
pub use error::{Error, ErrorKind, Result};
pub use specs::{ConnectionSpec, Data, MeshNodeSpec, MeshTopology, NodeId};

//! `roselet-mesh`: a peer-to-peer publish/subscribe and request/response
//! message mesh. See [`mesh`] for the module map.

pub mod mesh;

pub use mesh::node::{Node, NodeBuilder, ServiceProxy, TopicProxy};
pub use mesh::{ConnectionSpec, Data, Error, ErrorKind, MeshConfig, MeshNodeSpec, MeshTopology, NodeId, Result};

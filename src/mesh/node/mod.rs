//! C11: the node runtime. `builder` wires every C1–C10 manager from a
//! single `MeshConfig`; `node` exposes the public surface a caller actually
//! touches; `proxy` offers the bound-to-one-name convenience handles
//! returned by `Node::get_topic`/`Node::get_service`.
//!
//! Grounded on `original_source/src/rosy/node/node.py`'s `Node`,
//! `TopicProxy`, and `ServiceProxy`.

pub mod builder;
pub mod node;
pub mod proxy;

pub use builder::NodeBuilder;
pub use node::Node;
pub use proxy::{ServiceProxy, TopicProxy};

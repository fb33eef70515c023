//! Callback types shared by the listener registry and dispatcher.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::mesh::specs::Data;

pub type TopicCallback =
    Arc<dyn Fn(String, Vec<Data>, Vec<(String, Data)>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

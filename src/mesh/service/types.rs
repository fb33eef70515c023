//! Handler callback type shared by `ServiceHandlerManager`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::mesh::specs::Data;

/// Returns `Ok(result)` or `Err(message)` — the latter becomes an
/// error-status `ServiceResponse` (spec.md §4.9).
pub type ServiceCallback = Arc<
    dyn Fn(String, Vec<Data>, Vec<(String, Data)>) -> Pin<Box<dyn Future<Output = Result<Data, String>> + Send>>
        + Send
        + Sync,
>;

//! C4 (connection pool, lockable writer) and C5 (per-node outbox).

pub mod connection;
pub mod outbox;

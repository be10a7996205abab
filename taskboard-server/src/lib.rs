//! Taskboard server library.
//!
//! Exposes the server pieces for use in tests and embedding: the versioned
//! update coordinator, the task store it commits through, the group-scoped
//! broadcast hub, the bounded activity ledger, the group registry, and the
//! axum HTTP/WebSocket surface that wires them together.

pub mod config;
pub mod coordinator;
pub mod groups;
pub mod http;
pub mod hub;
pub mod ledger;
pub mod store;

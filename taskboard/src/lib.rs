//! Taskboard client library.
//!
//! Conflict-aware task updates against a board server: the REST client, the
//! retrying update loop, manual conflict resolution, the live group feed and
//! a local replica kept current by that feed.

pub mod api;
pub mod board;
pub mod config;
pub mod feed;
pub mod resolver;
pub mod retry;

#[cfg(test)]
mod testing;

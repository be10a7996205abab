//! Shared protocol definitions for Taskboard: the versioned task model,
//! activity entries, groups, REST bodies and the live channel wire format.

pub mod activity;
pub mod api;
pub mod channel;
pub mod group;
pub mod ids;
pub mod task;

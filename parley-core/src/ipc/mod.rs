//! Serialisable event types for hosts (CLI, UI bridges).
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them as JSON without mapping.

pub mod events;

//! Shared domain types for sagaflow.
//!
//! This crate contains the types used across the sagaflow workspace: workflow
//! documents, execution records, run events and engine configuration.
//!
//! Zero runtime dependencies -- only serde, uuid, chrono, schemars.

pub mod config;
pub mod event;
pub mod workflow;

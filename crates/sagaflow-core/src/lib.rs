//! Saga-style workflow execution for sagaflow.
//!
//! `workflow` holds the engine: definition loading and validation, the step
//! runner, retry/timeout/concurrency controls and compensation. `event` holds
//! the per-run broadcast bus the engine publishes lifecycle events to. The
//! crate depends only on `sagaflow-types`; task execution is delegated to a
//! caller-supplied `TaskAdapter`.

pub mod event;
pub mod workflow;

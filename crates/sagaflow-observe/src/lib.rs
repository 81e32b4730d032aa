//! Logging and trace export for sagaflow binaries.

pub mod tracing_setup;

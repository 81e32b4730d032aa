//! Scripted task adapter shared by the engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use super::adapter::{TaskAdapter, TaskError};
use super::context::ExecutionContext;

#[derive(Debug, Clone)]
struct Script {
    delay_ms: u64,
    /// Remaining attempts that fail before the action starts succeeding.
    failures: u32,
    error: TaskError,
    output: Option<Value>,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<(String, Value)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Adapter whose behaviour per action is scripted up front. Records every
/// invocation in order and the peak number of concurrent invocations.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedAdapter {
    inner: Arc<Inner>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(self, action: &str, script: Script) -> Self {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .insert(action.to_string(), script);
        self
    }

    pub fn ok(self, action: &str, output: Value) -> Self {
        self.script(
            action,
            Script {
                delay_ms: 0,
                failures: 0,
                error: TaskError::failed("unused"),
                output: Some(output),
            },
        )
    }

    pub fn fail(self, action: &str, error: TaskError) -> Self {
        self.script(
            action,
            Script {
                delay_ms: 0,
                failures: u32::MAX,
                error,
                output: None,
            },
        )
    }

    /// Fail the first `failures` attempts, then succeed with `output`.
    pub fn flaky(self, action: &str, failures: u32, error: TaskError, output: Value) -> Self {
        self.script(
            action,
            Script {
                delay_ms: 0,
                failures,
                error,
                output: Some(output),
            },
        )
    }

    pub fn slow(self, action: &str, delay_ms: u64, output: Value) -> Self {
        self.script(
            action,
            Script {
                delay_ms,
                failures: 0,
                error: TaskError::failed("unused"),
                output: Some(output),
            },
        )
    }

    pub fn slow_fail(self, action: &str, delay_ms: u64, error: TaskError) -> Self {
        self.script(
            action,
            Script {
                delay_ms,
                failures: u32::MAX,
                error,
                output: None,
            },
        )
    }

    /// Actions invoked so far, in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(action, _)| action.clone())
            .collect()
    }

    /// Inputs of every invocation of `action`.
    pub fn inputs_of(&self, action: &str) -> Vec<Value> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, inputs)| inputs.clone())
            .collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.calls().iter().filter(|a| *a == action).count()
    }

    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

impl TaskAdapter for ScriptedAdapter {
    async fn invoke(
        &self,
        action: &str,
        inputs: Value,
        _ctx: &ExecutionContext,
    ) -> Result<Value, TaskError> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .push((action.to_string(), inputs.clone()));
        let now = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);

        let script = {
            let mut scripts = self.inner.scripts.lock().unwrap();
            scripts.get_mut(action).map(|script| {
                let current = script.clone();
                script.failures = script.failures.saturating_sub(1);
                current
            })
        };

        if let Some(script) = &script {
            if script.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(script.delay_ms)).await;
            }
        }
        self.inner.active.fetch_sub(1, Ordering::SeqCst);

        match script {
            Some(script) if script.failures > 0 => Err(script.error),
            Some(script) => Ok(script.output.unwrap_or(Value::Null)),
            None => Ok(json!({ "action": action, "inputs": inputs })),
        }
    }
}

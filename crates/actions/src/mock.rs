//! `MockHandler`: a test double for `ActionHandler`.
//!
//! Useful in unit and integration tests where a real side-effect (email,
//! webhook) is either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::{traits::ActionContext, ActionError, ActionHandler};

/// Behaviour injected into `MockHandler` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
}

/// A mock handler that records every call it receives and returns a
/// programmer-specified result.
pub struct MockHandler {
    pub behaviour: MockBehaviour,
    /// All (config, context) pairs seen by this handler, in call order.
    pub calls: Arc<Mutex<Vec<(Value, ActionContext)>>>,
}

impl MockHandler {
    /// Create a mock that always succeeds with the given value.
    pub fn returning(value: Value) -> Self {
        Self::with(MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailRetryable(msg.into()))
    }

    fn with(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times this handler has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Configurations received, in call order.
    pub fn configs(&self) -> Vec<Value> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    /// Transition codes of the contexts received, in call order.
    pub fn transition_codes(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ctx)| ctx.transition_code.clone())
            .collect()
    }
}

#[async_trait]
impl ActionHandler for MockHandler {
    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<Value, ActionError> {
        self.calls.lock().unwrap().push((config.clone(), ctx.clone()));

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::FailRetryable(msg) => Err(ActionError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg)     => Err(ActionError::Fatal(msg.clone())),
        }
    }
}

//! Registry-backed action dispatcher.
//!
//! `RegistryDispatcher` maps an [`ActionKind`] to a boxed [`ActionHandler`]:
//! - `run` executes the handler on the caller's task.
//! - `dispatch` spawns a background task and logs the final outcome.
//!
//! Both re-try `Retryable` failures with exponential back-off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::traits::{ActionContext, ActionDispatcher, ActionHandler, ActionInvocation, ActionKind};
use crate::ActionError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for background actions.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of times a retryable failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

/// Maps action kinds to handler implementations.
pub type HandlerRegistry = HashMap<ActionKind, Arc<dyn ActionHandler>>;

// ---------------------------------------------------------------------------
// RegistryDispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RegistryDispatcher {
    registry: Arc<HandlerRegistry>,
    config: DispatchConfig,
}

impl RegistryDispatcher {
    pub fn new(registry: HandlerRegistry, config: DispatchConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    fn handler(&self, kind: ActionKind) -> Result<Arc<dyn ActionHandler>, ActionError> {
        self.registry
            .get(&kind)
            .cloned()
            .ok_or_else(|| ActionError::Unhandled(kind.to_string()))
    }
}

#[async_trait]
impl ActionDispatcher for RegistryDispatcher {
    async fn run(&self, invocation: &ActionInvocation) -> Result<Value, ActionError> {
        let handler = self.handler(invocation.kind)?;
        execute_with_retry(handler.as_ref(), &invocation.config, &invocation.context, &self.config).await
    }

    fn dispatch(&self, invocation: ActionInvocation) -> Result<(), ActionError> {
        let handler = self.handler(invocation.kind)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ActionError::Fatal(format!("no async runtime for queued action: {e}")))?;
        let config = self.config.clone();

        runtime.spawn(async move {
            let code = invocation.code.clone();
            let incident_id = invocation.context.incident_id;
            match execute_with_retry(
                handler.as_ref(),
                &invocation.config,
                &invocation.context,
                &config,
            )
            .await
            {
                Ok(_) => info!("queued action '{}' for incident {} succeeded", code, incident_id),
                Err(e) => error!("queued action '{}' for incident {} failed: {}", code, incident_id, e),
            }
        });

        Ok(())
    }
}

/// Execute a handler, retrying `Retryable` failures up to `max_retries`.
pub async fn execute_with_retry(
    handler: &dyn ActionHandler,
    action_config: &Value,
    ctx: &ActionContext,
    config: &DispatchConfig,
) -> Result<Value, ActionError> {
    let mut attempts = 0u32;

    loop {
        match handler.execute(action_config, ctx).await {
            Ok(output) => return Ok(output),

            Err(ActionError::Retryable(msg)) => {
                attempts += 1;
                if attempts > config.max_retries {
                    return Err(ActionError::Fatal(format!(
                        "retry limit of {} exceeded: {msg}",
                        config.max_retries
                    )));
                }

                let delay = config.retry_base_delay * 2u32.pow(attempts.saturating_sub(1));

                warn!(
                    "action retryable error (attempt {}/{}), retrying in {:?}: {}",
                    attempts, config.max_retries, delay, msg
                );

                tokio::time::sleep(delay).await;
            }

            Err(other) => return Err(other),
        }
    }
}

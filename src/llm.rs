//! Rate-limited, retrying LLM caller: key pool + completion client + retry policy.

use std::sync::Arc;

use tracing::debug;

use crate::clients::{CompletionClient, CompletionRequest};
use crate::config::GenerationConfig;
use crate::error::{AttrGenError, Result};
use crate::keys::KeyPool;
use crate::retry::{RetryPolicy, execute_with_retry};

pub struct LlmCaller {
    client: Arc<dyn CompletionClient>,
    pool: Arc<KeyPool>,
    policy: RetryPolicy,
    model: String,
    system_prompt: String,
    temperature: f32,
}

fn retry_hint(err: &AttrGenError) -> Option<std::time::Duration> {
    match err {
        AttrGenError::Client(client_err) => client_err.retry_after(),
        _ => None,
    }
}

impl LlmCaller {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        pool: Arc<KeyPool>,
        config: &GenerationConfig,
    ) -> Self {
        Self {
            client,
            pool,
            policy: config.retry_policy(),
            model: config.model_name.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// One attempt: a key the provider rejects is disabled and the request moves
    /// to the next key until one answers or none are left.
    async fn complete_on_any_key(
        &self,
        request: &CompletionRequest,
        attempt: u32,
    ) -> Result<String> {
        loop {
            let lease = self.pool.acquire().await?;
            let index = lease.index();
            debug!(attempt = attempt, key = %lease.key().name, "Dispatching LLM request");
            let reply = self.client.complete(request, lease.key()).await;
            drop(lease);

            match reply {
                Err(err) if err.is_unauthorized() => {
                    self.pool.disable(index);
                }
                other => return other.map_err(AttrGenError::from),
            }
        }
    }

    /// Send `user_prompt` and parse the reply, retrying transient failures.
    ///
    /// Each attempt takes its own key lease and releases it before parsing, so a
    /// retry may land on a different key. Rejected keys do not use up retries.
    pub async fn ask<T, P>(&self, user_prompt: String, parse: P) -> Result<T>
    where
        P: Fn(&str) -> Result<T>,
    {
        let request = CompletionRequest {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            user_prompt,
            temperature: self.temperature,
        };

        execute_with_retry(&self.policy, AttrGenError::is_retryable, retry_hint, |attempt| {
            let request = &request;
            let parse = &parse;
            async move {
                let text = self.complete_on_any_key(request, attempt).await?;
                parse(&text)
            }
        })
        .await
    }
}

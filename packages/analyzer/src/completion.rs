//! Completion client.
//!
//! Three failure classes are kept separate so each is independently
//! testable: transport retry (network-level backoff, here), content repair
//! (format-level salvage, in `llm_client::repair`), and model failover
//! (roster-level, `complete_failover`).

use crate::error::CompletionError;
use crate::roster::ModelRoster;
use async_trait::async_trait;
use llm_client::{parse_or_repair, ChatRequest, LlmClient, LlmError, Message};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for completion backends (to allow mocking).
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One completion call; returns the raw response text.
    async fn chat(&self, model: &str, system: &str, user: &str) -> Result<String, LlmError>;

    /// Identifiers of the models currently deployed on the backend.
    async fn list_models(&self) -> Result<Vec<String>, LlmError>;
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn chat(&self, model: &str, system: &str, user: &str) -> Result<String, LlmError> {
        let request = ChatRequest::new(model)
            .message(Message::system(system))
            .message(Message::user(user))
            .temperature(0.1)
            .json_mode();

        let response = self.chat_completion(request).await?;
        Ok(response.content)
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let models = LlmClient::list_models(self).await?;
        Ok(models.into_iter().map(|m| m.id).collect())
    }
}

/// Issues extraction requests to one model at a time, with transport
/// retries and response repair, reporting outcomes to the roster.
pub struct CompletionClient<B> {
    backend: B,
    roster: Arc<ModelRoster>,
    attempts: u32,
    backoff_base: Duration,
}

impl<B: ChatBackend> CompletionClient<B> {
    pub fn new(backend: B, roster: Arc<ModelRoster>, attempts: u32) -> Self {
        Self {
            backend,
            roster,
            attempts: attempts.max(1),
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Override the backoff base (tests use zero).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn roster(&self) -> &Arc<ModelRoster> {
        &self.roster
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// One structured completion against a specific model.
    ///
    /// Retries retryable transport/server errors with exponential backoff,
    /// then parses the response as JSON with a repair pass. Both terminal
    /// failure kinds are reported to the roster; success resets the model's
    /// failure streak.
    pub async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<serde_json::Value, CompletionError> {
        let mut last_error: Option<LlmError> = None;

        for attempt in 1..=self.attempts {
            match self.backend.chat(model, system, user).await {
                Ok(content) => {
                    return match parse_or_repair(&content) {
                        Ok(value) => {
                            self.roster.report_success(model);
                            Ok(value)
                        }
                        Err(e) => {
                            warn!(
                                model,
                                error = %e,
                                preview = %content.chars().take(200).collect::<String>(),
                                "response not salvageable as JSON"
                            );
                            self.roster.report_failure(model);
                            Err(CompletionError::Parse {
                                model: model.to_string(),
                                message: e.to_string(),
                            })
                        }
                    };
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(model, attempt, max = self.attempts, error = %e, "completion call failed");
                    last_error = Some(e);
                    if retryable && attempt < self.attempts {
                        tokio::time::sleep(self.backoff_base * 2u32.pow(attempt - 1)).await;
                        continue;
                    }
                    break;
                }
            }
        }

        self.roster.report_failure(model);
        Err(CompletionError::Backend {
            model: model.to_string(),
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown backend failure".to_string()),
        })
    }

    /// Walk the roster until one model yields a parsed response.
    ///
    /// Returns the winning model's name along with the parsed value so the
    /// caller can log which backend produced the round.
    pub async fn complete_failover(
        &self,
        system: &str,
        user: &str,
    ) -> Result<(String, serde_json::Value), CompletionError> {
        let models = self.roster.list_available();
        if models.is_empty() {
            return Err(CompletionError::NoModels);
        }

        let mut last_error = CompletionError::NoModels;
        for model in models {
            match self.complete(&model, system, user).await {
                Ok(value) => {
                    debug!(model = %model, "completion succeeded");
                    return Ok((model, value));
                }
                Err(e) => {
                    warn!(model = %model, error = %e, "model failed, trying next");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Backend scripted per model name.
    struct ScriptedBackend {
        /// (model, result) pairs; calls are recorded for assertions.
        responses: Vec<(String, Result<String, u16>)>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<(&str, Result<&str, u16>)>) -> Self {
            Self {
                responses: responses
                    .into_iter()
                    .map(|(m, r)| (m.to_string(), r.map(|s| s.to_string())))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(&self, model: &str, _system: &str, _user: &str) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(model.to_string());
            match self.responses.iter().find(|(m, _)| m == model) {
                Some((_, Ok(content))) => Ok(content.clone()),
                Some((_, Err(status))) => Err(LlmError::Api {
                    status: *status,
                    message: "scripted failure".into(),
                }),
                None => Err(LlmError::Config(format!("no script for {model}"))),
            }
        }

        async fn list_models(&self) -> Result<Vec<String>, LlmError> {
            Ok(self.responses.iter().map(|(m, _)| m.clone()).collect())
        }
    }

    fn client(backend: ScriptedBackend, models: &[&str], attempts: u32) -> CompletionClient<ScriptedBackend> {
        let deployed: Vec<String> = models.iter().map(|s| s.to_string()).collect();
        let roster = Arc::new(ModelRoster::new(&deployed, &[]));
        CompletionClient::new(backend, roster, attempts).with_backoff_base(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_failover_to_second_model() {
        let backend = ScriptedBackend::new(vec![
            ("model-a", Err(500)),
            ("model-b", Ok(r#"{"action": "SUBMIT"}"#)),
        ]);
        let client = client(backend, &["model-a", "model-b"], 1);

        let (model, value) = client.complete_failover("sys", "user").await.unwrap();
        assert_eq!(model, "model-b");
        assert_eq!(value["action"], "SUBMIT");
        // The loser's failure streak was recorded, the winner's reset.
        assert_eq!(client.roster().failure_count("model-a"), 1);
        assert_eq!(client.roster().failure_count("model-b"), 0);
    }

    #[tokio::test]
    async fn test_retryable_error_retries_before_surfacing() {
        let backend = ScriptedBackend::new(vec![("model-a", Err(429))]);
        let client = client(backend, &["model-a"], 3);

        let err = client.complete("model-a", "sys", "user").await.unwrap_err();
        assert!(matches!(err, CompletionError::Backend { .. }));
        assert_eq!(client.backend.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let backend = ScriptedBackend::new(vec![("model-a", Err(401))]);
        let client = client(backend, &["model-a"], 3);

        let err = client.complete("model-a", "sys", "user").await.unwrap_err();
        assert!(matches!(err, CompletionError::Backend { .. }));
        assert_eq!(client.backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_repair_salvages_fenced_response() {
        let backend = ScriptedBackend::new(vec![(
            "model-a",
            Ok("```json\n{\"action\": \"READ_DOC\"}\n```"),
        )]);
        let client = client(backend, &["model-a"], 1);

        let value = client.complete("model-a", "sys", "user").await.unwrap();
        assert_eq!(value["action"], "READ_DOC");
    }

    #[tokio::test]
    async fn test_unsalvageable_response_is_parse_error() {
        let backend = ScriptedBackend::new(vec![("model-a", Ok("I cannot help with that."))]);
        let client = client(backend, &["model-a"], 2);

        let err = client.complete("model-a", "sys", "user").await.unwrap_err();
        assert!(matches!(err, CompletionError::Parse { .. }));
        // Parse failures do not consume transport retries.
        assert_eq!(client.backend.calls().len(), 1);
        assert_eq!(client.roster().failure_count("model-a"), 1);
    }

    #[tokio::test]
    async fn test_empty_roster_is_no_models() {
        let backend = ScriptedBackend::new(vec![]);
        let roster = Arc::new(ModelRoster::new(&[], &[]));
        let client = CompletionClient::new(backend, roster, 1);

        let err = client.complete_failover("sys", "user").await.unwrap_err();
        assert!(matches!(err, CompletionError::NoModels));
    }
}

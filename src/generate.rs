//! Grounded answer synthesis.
//!
//! [`AnswerGenerator::generate`] turns a question and its retrieved passages
//! into an answer and never fails: when no backend is configured, or the
//! backend keeps failing, the caller gets the passages themselves behind a
//! short explanatory line.
//!
//! Rate-limit responses are retried with exponential backoff
//! (`base_delay * 2^attempt`); any other backend error ends the attempt loop
//! immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::GenerationConfig;
use crate::models::ScoredPassage;

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Why a backend call did not produce text.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("{0}")]
    Failure(String),
}

/// A text-completion service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait before retrying after the zero-based `attempt` was rate limited.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.min(16))
    }
}

/// Format passages as the context block shown to the backend.
pub fn build_context(passages: &[ScoredPassage]) -> String {
    passages
        .iter()
        .map(|p| format!("[Source: {}] {}", p.passage.source, p.passage.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "You are a document question-answering assistant.\n\
         Answer the question using only the context below. \
         If the context does not contain the answer, say that you don't know.\n\n\
         Context:\n{}\n\n\
         Question: {}\n\n\
         Answer:",
        context, question
    )
}

pub struct AnswerGenerator {
    backend: Option<Arc<dyn GenerationBackend>>,
    retry: RetryPolicy,
}

impl AnswerGenerator {
    pub fn new(backend: Option<Arc<dyn GenerationBackend>>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Generator that always answers with the raw excerpts.
    pub fn unconfigured() -> Self {
        Self::new(None, RetryPolicy::default())
    }

    /// Build from config. A missing API key is not an error; the generator
    /// then runs without a backend.
    pub fn from_config(config: &GenerationConfig) -> anyhow::Result<Self> {
        let retry = RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
        };
        if config.provider == "disabled" {
            return Ok(Self::new(None, retry));
        }
        let backend: Option<Arc<dyn GenerationBackend>> = match config.api_key() {
            Some(key) => Some(Arc::new(GeminiBackend::new(config, key)?)),
            None => {
                info!(
                    env = %config.api_key_env,
                    "no generation API key set, answers will be raw excerpts"
                );
                None
            }
        };
        Ok(Self::new(backend, retry))
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    /// Answer `question` from `passages`.
    pub async fn generate(&self, question: &str, passages: &[ScoredPassage]) -> String {
        let context = build_context(passages);
        let backend = match self.backend {
            Some(ref b) => b,
            None => {
                return format!(
                    "Generation backend not configured. Here are the most relevant excerpts:\n\n{}",
                    context
                )
            }
        };

        let prompt = build_prompt(question, &context);
        let mut attempt = 0;
        loop {
            match backend.complete(&prompt).await {
                Ok(text) if text.trim().is_empty() => return context,
                Ok(text) => return text.trim().to_string(),
                Err(GenerationError::RateLimited(msg)) if attempt + 1 < self.retry.max_attempts => {
                    let wait = self.retry.delay_for(attempt);
                    warn!(
                        backend = backend.name(),
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        reason = %msg,
                        "generation rate limited, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "generation failed");
                    return format!(
                        "Generation failed: {}. Here are the most relevant excerpts:\n\n{}",
                        e, context
                    );
                }
            }
        }
    }
}

// ============ Gemini ============

/// Google Generative Language API (`models/{model}:generateContent`).
pub struct GeminiBackend {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(config: &GenerationConfig, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/models/{}:generateContent", GEMINI_ENDPOINT, self.model);
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Failure(format!("request failed: {}", e)))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Failure(format!(
                "HTTP {}: {}",
                status,
                text.chars().take(300).collect::<String>()
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GenerationError::Failure(format!("invalid response: {}", e)))?;
        let text = parse_gemini_response(&json);
        debug!(model = %self.model, chars = text.len(), "generation complete");
        Ok(text)
    }
}

/// Concatenate the text parts of the first candidate.
fn parse_gemini_response(json: &serde_json::Value) -> String {
    json["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Passage;
    use std::sync::Mutex;

    /// Replays a fixed sequence of responses and records every prompt.
    struct ScriptedBackend {
        responses: Mutex<Vec<Result<String, GenerationError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(mut responses: Vec<Result<String, GenerationError>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(GenerationError::Failure("script exhausted".into())))
        }
    }

    fn hits() -> Vec<ScoredPassage> {
        vec![
            ScoredPassage {
                score: 0.9,
                passage: Passage {
                    id: 0,
                    doc_id: "d1".into(),
                    source: "cats.txt".into(),
                    text: "Cats sleep a lot.".into(),
                },
            },
            ScoredPassage {
                score: 0.5,
                passage: Passage {
                    id: 1,
                    doc_id: "d2".into(),
                    source: "dogs.txt".into(),
                    text: "Dogs bark.".into(),
                },
            },
        ]
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn context_format() {
        assert_eq!(
            build_context(&hits()),
            "[Source: cats.txt] Cats sleep a lot.\n\n[Source: dogs.txt] Dogs bark."
        );
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn unconfigured_returns_excerpts() {
        let answer = AnswerGenerator::unconfigured()
            .generate("Do cats sleep?", &hits())
            .await;
        assert!(answer.starts_with("Generation backend not configured."));
        assert!(answer.contains("Cats sleep a lot."));
    }

    #[tokio::test]
    async fn prompt_contains_question_and_context() {
        let backend = ScriptedBackend::new(vec![Ok("  They do.  ".into())]);
        let generator = AnswerGenerator::new(Some(backend.clone()), fast_retry());
        assert_eq!(generator.generate("Do cats sleep?", &hits()).await, "They do.");
        let prompt = backend.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("Question: Do cats sleep?"));
        assert!(prompt.contains("[Source: dogs.txt] Dogs bark."));
    }

    #[tokio::test]
    async fn rate_limited_twice_then_succeeds() {
        let backend = ScriptedBackend::new(vec![
            Err(GenerationError::RateLimited("429".into())),
            Err(GenerationError::RateLimited("429".into())),
            Ok("Cats sleep a lot.".into()),
        ]);
        let generator = AnswerGenerator::new(Some(backend.clone()), fast_retry());
        let answer = generator.generate("Do cats sleep?", &hits()).await;
        assert_eq!(answer, "Cats sleep a lot.");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn rate_limit_exhausts_attempts() {
        let backend = ScriptedBackend::new(vec![
            Err(GenerationError::RateLimited("429".into())),
            Err(GenerationError::RateLimited("429".into())),
            Err(GenerationError::RateLimited("429".into())),
            Ok("never reached".into()),
        ]);
        let generator = AnswerGenerator::new(Some(backend.clone()), fast_retry());
        let answer = generator.generate("q", &hits()).await;
        assert!(answer.starts_with("Generation failed: rate limited: 429."));
        assert!(answer.contains("Dogs bark."));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let backend = ScriptedBackend::new(vec![
            Err(GenerationError::Failure("HTTP 500".into())),
            Ok("never reached".into()),
        ]);
        let generator = AnswerGenerator::new(Some(backend.clone()), fast_retry());
        let answer = generator.generate("q", &hits()).await;
        assert!(answer.starts_with("Generation failed: HTTP 500."));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn empty_completion_falls_back_to_context() {
        let backend = ScriptedBackend::new(vec![Ok("   ".into())]);
        let generator = AnswerGenerator::new(Some(backend), fast_retry());
        assert_eq!(
            generator.generate("q", &hits()).await,
            build_context(&hits())
        );
    }

    #[test]
    fn gemini_response_parts_are_joined() {
        let json = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello" }, { "text": ", world" }] }
            }]
        });
        assert_eq!(parse_gemini_response(&json), "Hello, world");
        assert_eq!(parse_gemini_response(&serde_json::json!({})), "");
    }

    #[test]
    fn disabled_provider_has_no_backend() {
        let config = GenerationConfig {
            provider: "disabled".to_string(),
            ..GenerationConfig::default()
        };
        assert!(!AnswerGenerator::from_config(&config).unwrap().is_configured());
    }
}

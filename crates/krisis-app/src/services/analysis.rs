//! Language-model analysis adapter.
//!
//! Every task gets a fresh completion call; results are never cached here.
//! The queue provides the outer async/dedup boundary, this adapter only
//! handles the call itself and its own bounded retry schedule.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AnalysisConfig;

const COMPLETIONS_ENDPOINT: &str = "chat/completions";
const ORG_HEADER: &str = "OpenAI-Organization";

/// Analyst instruction sent as the system message with every request.
pub const ANALYSIS_SYSTEM_PROMPT: &str = "Analyze the news article provided below and generate a consistent semantic and sentiment analysis for an end-user of a news aggregator app. Your analysis should include:\n1. Objectivity and neutrality score (0-10 scale): Provide a score for the objectivity and neutrality of the article, where 0 is the least objective/neutral and 10 is the most objective/neutral. Concisely list the reasons that led to this score, using specific examples from the article.\n2. Ideological/political bias detection: List up to 5 tags/labels (max. 5 words each) describing the nature and extent of the bias, indicating the direction of the bias. Provide a concise explanation of the factors contributing to each bias label, using specific examples from the article.\nConsider the following aspects for your analysis:\na. Balance of perspectives\nb. Language and tone\nc. Focus on facts versus opinions\nd. Selective presentation of information\ne. Use of reliable and verifiable sources\n\nAfter your analysis, generate a concise, objective, neutral, and unbiased summary of the article in just a few sentences. \n\nPlease also provide a brief overall assessment of the article, considering both its strengths and weaknesses, and suggest potential ways to improve its objectivity, neutrality, or balance, if necessary.\n\nAnalyze the following news article, keeping in mind its publication date, the author's history, and the outlet's reputation:";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("language model request timed out")]
    Timeout,
    #[error("language model error: {0}")]
    Provider(String),
    #[error("Analysis failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<AnalysisError>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub n: u8,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Completion response with every provider field optional; the payload is
/// persisted wholesale as the task result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<CompletionUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: Option<u32>,
    pub message: Option<CompletionMessage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl ChatCompletion {
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.message.as_ref())
            .and_then(|message| message.content.as_deref())
    }
}

/// Transport seam for the completion endpoint, so the retry schedule can be
/// exercised without a network.
#[async_trait]
pub trait CompletionApi: Send + Sync + 'static {
    async fn complete(&self, request: &CompletionRequest) -> Result<ChatCompletion, AnalysisError>;
}

#[derive(Clone)]
pub struct HttpCompletionApi {
    http: Client,
    base_url: String,
    api_key: String,
    org_id: Option<String>,
}

impl HttpCompletionApi {
    pub fn new(cfg: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|err| AnalysisError::Provider(err.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            org_id: cfg.org_id.clone(),
        })
    }
}

#[async_trait]
impl CompletionApi for HttpCompletionApi {
    async fn complete(&self, request: &CompletionRequest) -> Result<ChatCompletion, AnalysisError> {
        let url = format!("{}/{COMPLETIONS_ENDPOINT}", self.base_url);
        let mut call = self.http.post(url).bearer_auth(&self.api_key).json(request);
        if let Some(org_id) = &self.org_id {
            call = call.header(ORG_HEADER, org_id);
        }

        let response = call.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("error")?
                        .get("message")?
                        .as_str()
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("completion endpoint returned {status}"));
            return Err(AnalysisError::Provider(message));
        }

        response
            .json::<ChatCompletion>()
            .await
            .map_err(classify_transport)
    }
}

fn classify_transport(error: reqwest::Error) -> AnalysisError {
    if error.is_timeout() {
        AnalysisError::Timeout
    } else {
        AnalysisError::Provider(error.to_string())
    }
}

#[derive(Clone)]
pub struct AnalysisClient<A = HttpCompletionApi> {
    api: A,
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_attempts: u32,
    initial_delay: Duration,
}

impl AnalysisClient<HttpCompletionApi> {
    pub fn from_config(cfg: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let api = HttpCompletionApi::new(cfg)?;
        Ok(Self::new(api, cfg))
    }
}

impl<A: CompletionApi> AnalysisClient<A> {
    pub fn new(api: A, cfg: &AnalysisConfig) -> Self {
        debug_assert!(cfg.max_attempts > 0);
        Self {
            api,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
        }
    }

    /// Run the analysis with up to `max_attempts` calls, doubling the wait
    /// between attempts. After the final failure the error names the attempt
    /// count and carries the last underlying error.
    pub async fn analyze(&self, content: &str) -> Result<ChatCompletion, AnalysisError> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: ANALYSIS_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: content.to_string(),
                },
            ],
            max_tokens: self.max_tokens,
            n: 1,
            temperature: self.temperature,
        };

        let mut delay = self.initial_delay;
        let mut attempt = 0;

        loop {
            tracing::info!(
                attempt = attempt + 1,
                max_attempts = self.max_attempts,
                "analyzing article with language model"
            );

            match self.api.complete(&request).await {
                Ok(completion) => {
                    tracing::debug!(
                        model = completion.model.as_deref().unwrap_or("unknown"),
                        total_tokens = completion
                            .usage
                            .as_ref()
                            .and_then(|usage| usage.total_tokens),
                        "language model analysis completed"
                    );
                    return Ok(completion);
                }
                Err(error) => {
                    attempt += 1;
                    tracing::warn!(
                        %error,
                        attempt,
                        max_attempts = self.max_attempts,
                        "language model call failed"
                    );
                    if attempt >= self.max_attempts {
                        return Err(AnalysisError::Exhausted {
                            attempts: self.max_attempts,
                            source: Box::new(error),
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    struct FlakyApi {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyApi {
        fn failing_first(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl CompletionApi for FlakyApi {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<ChatCompletion, AnalysisError> {
            assert_eq!(request.n, 1);
            assert_eq!(request.max_tokens, 1_000);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AnalysisError::Provider("overloaded".to_string()));
            }
            Ok(ChatCompletion {
                id: Some("cmpl-1".to_string()),
                model: Some(request.model.clone()),
                choices: vec![CompletionChoice {
                    index: Some(0),
                    message: Some(CompletionMessage {
                        role: Some("assistant".to_string()),
                        content: Some("analysis".to_string()),
                    }),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: None,
            })
        }
    }

    fn client(api: FlakyApi) -> AnalysisClient<FlakyApi> {
        AnalysisClient::new(api, &AnalysisConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_a_later_attempt_after_transient_failures() {
        let client = client(FlakyApi::failing_first(2));
        let completion = client.analyze("article body").await.expect("third attempt succeeds");

        assert_eq!(completion.content(), Some("analysis"));
        assert_eq!(client.api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_three_attempts_with_doubling_delays() {
        let client = client(FlakyApi::failing_first(u32::MAX));
        let started = Instant::now();

        let error = client.analyze("article body").await.expect_err("all attempts fail");

        assert_eq!(client.api.calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second, no wait after the last.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        match error {
            AnalysisError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert!(
            error.to_string().starts_with("Analysis failed after 3 attempts:"),
            "terminal error names the attempt count: {error}"
        );
    }

    #[tokio::test]
    async fn request_carries_the_system_prompt_and_user_content() {
        struct CapturingApi;

        #[async_trait]
        impl CompletionApi for CapturingApi {
            async fn complete(
                &self,
                request: &CompletionRequest,
            ) -> Result<ChatCompletion, AnalysisError> {
                assert_eq!(request.messages.len(), 2);
                assert_eq!(request.messages[0].role, "system");
                assert!(request.messages[0].content.starts_with("Analyze the news article"));
                assert_eq!(request.messages[1].role, "user");
                assert_eq!(request.messages[1].content, "the article");
                assert!((request.temperature - 0.7).abs() < f32::EPSILON);
                Ok(ChatCompletion {
                    id: None,
                    model: None,
                    choices: Vec::new(),
                    usage: None,
                })
            }
        }

        let client = AnalysisClient::new(CapturingApi, &AnalysisConfig::default());
        client.analyze("the article").await.expect("completes");
    }
}

//! Inference providers – decide the next reasoning step.
//!
//! Given the question, the evidence retrieved for the current step, the
//! conclusions reached so far and the verification outcome, an
//! [`InferenceProvider`] either asks for another retrieval round with a
//! refined query or produces a final answer with optional candidate facts
//! for the rule engine to check.
//!
//! [`ChatCompletionsProvider`] talks to any OpenAI-compatible
//! `/v1/chat/completions` endpoint (such as Ollama on
//! `http://localhost:11434`) and constrains the reply with the JSON schema of
//! [`Decision`]:
//!
//! ```rust,no_run
//! use neuros_runtime::inference::ChatCompletionsProvider;
//!
//! let provider = ChatCompletionsProvider::new("http://localhost:11434", "llama3");
//! ```

use async_trait::async_trait;
use neuros_types::{RecordId, ScoreBreakdown, VerificationOutcome};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum InferenceError {
    /// Worth retrying (overload, dropped connection, garbled output).
    #[error("Transient inference failure: {0}")]
    Transient(String),
    #[error("Inference failed: {0}")]
    Fatal(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl InferenceError {
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Transient(_) | InferenceError::BadResponse(_) => true,
            InferenceError::Fatal(_) => false,
            InferenceError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request / decision
// ─────────────────────────────────────────────────────────────────────────────

/// A retrieved record as shown to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: RecordId,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub question: String,
    /// Query fragment used for this step's retrieval.
    pub fragment: String,
    /// Zero-based step index.
    pub step: usize,
    pub max_depth: usize,
    pub evidence: Vec<EvidenceItem>,
    /// Conclusions of earlier steps, oldest first.
    pub prior_conclusions: Vec<String>,
    pub verification: VerificationOutcome,
}

impl InferenceRequest {
    pub fn is_last_step(&self) -> bool {
        self.step + 1 >= self.max_depth
    }
}

/// What to do after a reasoning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Retrieve again with a refined query.
    Continue {
        refined_query: String,
        #[serde(default)]
        rationale: String,
    },
    /// Conclude. `facts` are candidate ground facts in rule notation, e.g.
    /// `deadline(r1, "Q3")`, checked against the hard constraints.
    Final {
        answer: String,
        #[serde(default)]
        facts: Vec<String>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, request: &InferenceRequest) -> Result<Decision, InferenceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// EvidenceSynthesizer
// ─────────────────────────────────────────────────────────────────────────────

pub const NO_EVIDENCE_ANSWER: &str = "I don't have any relevant memories to answer that question.";

/// Local provider that answers directly from the retrieved evidence.
///
/// Always concludes in the first step, listing the evidence in rank order.
/// Output depends only on the request, so traces built with it are
/// reproducible.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvidenceSynthesizer;

#[async_trait]
impl InferenceProvider for EvidenceSynthesizer {
    fn name(&self) -> &str {
        "evidence"
    }

    async fn decide(&self, request: &InferenceRequest) -> Result<Decision, InferenceError> {
        if request.evidence.is_empty() {
            return Ok(Decision::Final {
                answer: NO_EVIDENCE_ANSWER.to_string(),
                facts: Vec::new(),
            });
        }
        let lines: Vec<String> = request
            .evidence
            .iter()
            .enumerate()
            .map(|(i, e)| format!("Memory {} ({}, score {:.2}): {}", i + 1, e.id, e.score, e.content))
            .collect();
        let answer = format!(
            "Based on {} relevant memories:\n\n{}\n\nTo answer '{}', I found the above related information.",
            request.evidence.len(),
            lines.join("\n"),
            request.question
        );
        Ok(Decision::Final {
            answer,
            facts: Vec::new(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ChatCompletionsProvider
// ─────────────────────────────────────────────────────────────────────────────

pub const SYSTEM_PROMPT: &str = "\
You answer questions from a personal knowledge store.
You receive the question, the evidence retrieved for this step, earlier conclusions and \
the result of a consistency check. Reply with a JSON object:
- {\"decision\": \"continue\", \"refined_query\": ..., \"rationale\": ...} when the evidence \
is insufficient and another retrieval would help;
- {\"decision\": \"final\", \"answer\": ..., \"facts\": [...]} when you can answer. List in \
`facts` the ground facts your answer asserts, in the form predicate(arg, arg).
Only cite information present in the evidence. On the last step you must answer.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// JSON schema of [`Decision`], injected into every request.
pub fn decision_schema() -> serde_json::Value {
    serde_json::to_value(schema_for!(Decision)).unwrap_or(serde_json::Value::Null)
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct ChatCompletionsProvider {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatCompletionsProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    /// Send `key` as a bearer token; empty keys are ignored.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    fn messages(request: &InferenceRequest) -> Result<Vec<ChatMessage>, InferenceError> {
        let body = serde_json::to_string_pretty(request)
            .map_err(|e| InferenceError::Fatal(format!("cannot encode request: {e}")))?;
        Ok(vec![
            ChatMessage {
                role: Role::System,
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: body,
            },
        ])
    }

    fn parse_decision(content: &str) -> Result<Decision, InferenceError> {
        serde_json::from_str(content.trim())
            .map_err(|e| InferenceError::BadResponse(format!("{e}: {content}")))
    }
}

#[async_trait]
impl InferenceProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        "chat"
    }

    async fn decide(&self, request: &InferenceRequest) -> Result<Decision, InferenceError> {
        let messages = Self::messages(request)?;
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: false,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: decision_schema(),
            },
        };

        let mut http = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let response: ChatResponse = http
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| InferenceError::BadResponse("empty choices array".into()))?;
        Self::parse_decision(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(evidence: Vec<EvidenceItem>) -> InferenceRequest {
        InferenceRequest {
            question: "When is the project X deadline?".into(),
            fragment: "project X deadline".into(),
            step: 0,
            max_depth: 3,
            evidence,
            prior_conclusions: Vec::new(),
            verification: VerificationOutcome::Consistent,
        }
    }

    fn item(id: i64, score: f32, content: &str) -> EvidenceItem {
        EvidenceItem {
            id: RecordId(id),
            score,
            breakdown: ScoreBreakdown::default(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn synthesizer_without_evidence_says_so() {
        let d = EvidenceSynthesizer.decide(&request(vec![])).await.unwrap();
        assert_eq!(
            d,
            Decision::Final {
                answer: NO_EVIDENCE_ANSWER.into(),
                facts: vec![]
            }
        );
    }

    #[tokio::test]
    async fn synthesizer_lists_evidence_in_rank_order() {
        let d = EvidenceSynthesizer
            .decide(&request(vec![
                item(2, 0.9, "deadline moved to Q3"),
                item(1, 0.4, "project X kickoff"),
            ]))
            .await
            .unwrap();
        let Decision::Final { answer, .. } = d else {
            panic!("expected final decision");
        };
        assert!(answer.starts_with("Based on 2 relevant memories"));
        let first = answer.find("r2").unwrap();
        let second = answer.find("r1").unwrap();
        assert!(first < second);
    }

    #[test]
    fn decision_json_shape() {
        let d: Decision =
            serde_json::from_str(r#"{"decision":"final","answer":"Q3","facts":["deadline(r1, Q3)"]}"#)
                .unwrap();
        assert!(matches!(d, Decision::Final { ref facts, .. } if facts.len() == 1));
        let c: Decision =
            serde_json::from_str(r#"{"decision":"continue","refined_query":"deadline"}"#).unwrap();
        assert!(matches!(c, Decision::Continue { ref rationale, .. } if rationale.is_empty()));
    }

    #[test]
    fn schema_names_both_decisions() {
        let schema = decision_schema().to_string();
        assert!(schema.contains("continue"));
        assert!(schema.contains("final"));
        assert!(schema.contains("refined_query"));
    }

    #[test]
    fn garbled_reply_is_transient() {
        let err = ChatCompletionsProvider::parse_decision("sure! the answer is Q3").unwrap_err();
        assert!(err.is_transient());
        assert!(!InferenceError::Fatal("bad key".into()).is_transient());
    }

    #[test]
    fn request_is_sent_as_user_message() {
        let msgs = ChatCompletionsProvider::messages(&request(vec![item(1, 0.5, "x")])).unwrap();
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].role, Role::User);
        assert!(msgs[1].content.contains("project X deadline"));
    }

    #[test]
    fn last_step_detection() {
        let mut r = request(vec![]);
        assert!(!r.is_last_step());
        r.step = 2;
        assert!(r.is_last_step());
    }
}

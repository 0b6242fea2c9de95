//! External judgment function.
//!
//! The curator model is an opaque collaborator: given a fragment and its
//! context it returns accept/reject with a confidence. [`HttpJudge`] talks
//! to any OpenAI-compatible chat completion endpoint.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::VerdictRecord;
use crate::types::{Dimension, FragmentStatus, Stage};

/// Reason recorded when a judge rejects without explaining why.
pub const DEFAULT_REJECTION_REASON: &str = "Rejected by curator without a stated reason";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoulContext {
    pub handle: String,
    pub display_name: String,
    pub stage: Stage,
    /// Current condensed summary for the dimension being judged.
    pub dimension_summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiblingFragment {
    pub dimension: Dimension,
    pub content: String,
}

/// Everything the judge sees for one fragment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeRequest {
    pub soul: SoulContext,
    pub dimension: Dimension,
    pub content: String,
    /// The other fragments of the same batch.
    pub siblings: Vec<SiblingFragment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub verdict: Verdict,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Judgment {
    pub fn accept(confidence: f64) -> Self {
        Self {
            verdict: Verdict::Accept,
            confidence,
            reason: None,
        }
    }

    pub fn reject(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Reject,
            confidence,
            reason: Some(reason.into()),
        }
    }

    /// Normalise into a storable verdict: confidence clamped to `[0, 1]`,
    /// rejections always carry a reason, acceptances never do.
    pub fn into_record(self) -> VerdictRecord {
        let confidence = if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        };
        match self.verdict {
            Verdict::Accept => VerdictRecord {
                status: FragmentStatus::Accepted,
                confidence,
                reason: None,
            },
            Verdict::Reject => {
                let reason = self
                    .reason
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string());
                VerdictRecord {
                    status: FragmentStatus::Rejected,
                    confidence,
                    reason: Some(reason),
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judge request failed: {0}")]
    Transport(String),

    #[error("judge returned an unusable reply: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for JudgeError {
    fn from(err: reqwest::Error) -> Self {
        JudgeError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait Judge: Send + Sync + fmt::Debug {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment, JudgeError>;
}

// ---------------------------------------------------------------------------
// HTTP judge
// ---------------------------------------------------------------------------

const CURATOR_INSTRUCTIONS: &str = "You curate contributions to a personality profile of a public figure. \
Judge whether the contribution is accurate, specific, relevant to the named dimension, \
and not redundant with its sibling contributions or the existing summary. \
Reply with a JSON object only: {\"verdict\": \"accept\" | \"reject\", \
\"confidence\": number between 0 and 1, \"reason\": string explaining a rejection}.";

#[derive(Debug, Clone)]
pub struct HttpJudgeConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Judge backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct HttpJudge {
    config: HttpJudgeConfig,
    client: reqwest::Client,
}

impl HttpJudge {
    pub fn new(config: HttpJudgeConfig) -> Result<Self, JudgeError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, request: &JudgeRequest) -> Result<Value, JudgeError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| JudgeError::Malformed(format!("could not encode request: {}", e)))?;
        Ok(serde_json::json!({
            "model": self.config.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": CURATOR_INSTRUCTIONS},
                {"role": "user", "content": payload},
            ],
        }))
    }
}

#[async_trait]
impl Judge for HttpJudge {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment, JudgeError> {
        log::debug!(
            "HttpJudge.judge: soul={}, dimension={}",
            request.soul.handle,
            request.dimension
        );

        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json");
        if let Some(ref key) = self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.json(&self.request_body(request)?).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(JudgeError::Transport(format!(
                "judge endpoint returned {}: {}",
                status,
                excerpt(&text, ERROR_EXCERPT_CHARS)
            )));
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| JudgeError::Malformed(format!("response is not JSON: {}", e)))?;
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| JudgeError::Malformed("missing choices[0].message.content".into()))?;
        parse_judgment(content)
    }
}

const ERROR_EXCERPT_CHARS: usize = 300;

/// At most `max_chars` characters of `text`, cut on a character boundary.
fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Parse the model's reply, tolerating a surrounding markdown code fence.
pub fn parse_judgment(content: &str) -> Result<Judgment, JudgeError> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(json).map_err(|e| JudgeError::Malformed(format!("{}: {}", e, json)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let j = parse_judgment(r#"{"verdict": "accept", "confidence": 0.8}"#).unwrap();
        assert_eq!(j.verdict, Verdict::Accept);
        assert_eq!(j.confidence, 0.8);
        assert!(j.reason.is_none());
    }

    #[test]
    fn test_parse_fenced_json() {
        let reply = "```json\n{\"verdict\": \"reject\", \"confidence\": 0.3, \"reason\": \"off-topic\"}\n```";
        let j = parse_judgment(reply).unwrap();
        assert_eq!(j.verdict, Verdict::Reject);
        assert_eq!(j.reason.as_deref(), Some("off-topic"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_judgment("I think it's fine"),
            Err(JudgeError::Malformed(_))
        ));
        assert!(parse_judgment(r#"{"verdict": "maybe"}"#).is_err());
    }

    #[test]
    fn test_record_normalisation() {
        let record = Judgment::accept(1.7).into_record();
        assert_eq!(record.status, FragmentStatus::Accepted);
        assert_eq!(record.confidence, 1.0);
        assert!(record.reason.is_none());

        let record = Judgment {
            verdict: Verdict::Reject,
            confidence: f64::NAN,
            reason: Some("   ".into()),
        }
        .into_record();
        assert_eq!(record.status, FragmentStatus::Rejected);
        assert_eq!(record.confidence, 0.0);
        assert_eq!(record.reason.as_deref(), Some(DEFAULT_REJECTION_REASON));
    }

    /// Answer one HTTP request on a local port with a fixed response.
    async fn serve_once(status_line: &'static str, body: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                if n == 0 {
                    break;
                }
                read += n;
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                if let Some(end) = request.find("\r\n\r\n") {
                    let length = request[..end]
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if read >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn request() -> JudgeRequest {
        JudgeRequest {
            soul: SoulContext {
                handle: "ada".into(),
                display_name: "Ada".into(),
                stage: Stage::Embryo,
                dimension_summary: String::new(),
            },
            dimension: Dimension::Style,
            content: "Writes in long, carefully hedged sentences.".into(),
            siblings: Vec::new(),
        }
    }

    #[test]
    fn test_excerpt_cuts_on_char_boundary() {
        let text = format!("{}é tail", "x".repeat(299));
        let cut = excerpt(&text, 300);
        assert_eq!(cut.chars().count(), 300);
        assert!(cut.ends_with('é'));
        assert_eq!(excerpt("short", 300), "short");
    }

    #[tokio::test]
    async fn test_error_body_with_multibyte_text_is_transport_error() {
        let body = format!("{}é tail", "x".repeat(299));
        let base_url = serve_once("500 Internal Server Error", body).await;
        let judge = HttpJudge::new(HttpJudgeConfig {
            base_url,
            model: "curator".into(),
            api_key: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        match judge.judge(&request()).await {
            Err(JudgeError::Transport(message)) => {
                assert!(message.contains("500"));
                assert!(message.ends_with("xé"));
                assert!(!message.contains("tail"));
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_http_judge_endpoint_joins_cleanly() {
        let judge = HttpJudge::new(HttpJudgeConfig {
            base_url: "http://localhost:9000/v1/".into(),
            model: "curator".into(),
            api_key: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(judge.endpoint(), "http://localhost:9000/v1/chat/completions");
    }
}

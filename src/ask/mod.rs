//! The science Q&A proxy behind `/api/ask`.

pub mod blocklist;
pub mod rate_limit;
pub mod upstream;

pub use rate_limit::RateLimiter;
pub use upstream::{ChatClient, UpstreamError};

use crate::error::AppError;

pub const REFUSAL_REPLY: &str =
    "I only answer science and math-related questions. I can't help with that topic.";

pub struct AskService {
    client: ChatClient,
}

impl AskService {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    pub fn has_api_key(&self) -> bool {
        self.client.has_api_key()
    }

    /// Answer a question. Blocked topics get a canned refusal without
    /// touching the upstream API.
    pub async fn answer(&self, question: &str) -> Result<String, AppError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AppError::BadRequest("Missing question".into()));
        }

        if blocklist::is_blocked(question) {
            tracing::info!("refused blocked question");
            return Ok(REFUSAL_REPLY.to_string());
        }

        self.client.complete(question).await.map_err(|e| match e {
            UpstreamError::MissingApiKey => AppError::MissingApiKey,
            UpstreamError::Rejected(details) => AppError::Upstream(details),
            UpstreamError::Transport(err) => AppError::Upstream(err.to_string()),
        })
    }
}

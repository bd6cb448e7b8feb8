/// How a content-service call failed. Only `NotFound` on a chunk fetch is an expected
/// outcome (the lecture is over); every other variant is fatal for the attempt.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("content service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode content service response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("content service request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ContentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContentError::NotFound(_))
    }
}

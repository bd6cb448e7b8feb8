//! Inbound event names and payload pieces. Inbound frames are classified from raw JSON
//! because the service ships several payload shapes for the same event family.

pub const ERROR: &str = "error";
pub const RESPONSE_CREATED: &str = "response.created";
pub const RESPONSE_DONE: &str = "response.done";
pub const RESPONSE_COMPLETED: &str = "response.completed";
pub const INPUT_TRANSCRIPTION_COMPLETED: &str =
    "conversation.item.input_audio_transcription.completed";
pub const INPUT_TRANSCRIPTION_DELTA: &str = "conversation.item.input_audio_transcription.delta";

/// Every event type that streams a slice of the assistant's running answer.
pub const ASSISTANT_TEXT_DELTAS: [&str; 4] = [
    "response.audio_transcript.delta",
    "response.output_audio_transcript.delta",
    "response.text.delta",
    "response.output_text.delta",
];

/// Error code sent when `response.cancel` arrives after the response already ended.
pub const CANCEL_NOT_ACTIVE: &str = "response_cancel_not_active";
/// Error code sent when `response.create` races an in-progress response.
pub const ACTIVE_RESPONSE_EXISTS: &str = "conversation_already_has_active_response";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorDetails {
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

impl ErrorDetails {
    pub fn error_type(&self) -> Option<&str> {
        self.error_type.as_deref()
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_details_tolerate_missing_fields() {
        let details: ErrorDetails =
            serde_json::from_str(r#"{"type":"invalid_request_error","message":"bad"}"#).unwrap();
        assert_eq!(details.error_type(), Some("invalid_request_error"));
        assert_eq!(details.code(), None);
        assert_eq!(details.message(), "bad");
    }
}

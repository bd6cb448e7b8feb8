use crate::transport::Transport;
use anyhow::Result;
use openai_realtime_types::audio::{
    ServerVadTurnDetection, TranscriptionModel, TurnDetection, Voice,
};
use openai_realtime_types::events::client::{
    ConversationItemCreateEvent, ResponseCancelEvent, ResponseCreateEvent, SessionUpdateEvent,
};
use openai_realtime_types::events::server::{self, ErrorDetails};
use openai_realtime_types::{ClientEvent, Item, MessageItem, Session};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Outbound intents, independent of the wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    ConfigureSession { instructions: String, voice: String },
    CreateUserTurn(String),
    RequestResponse,
    CancelResponse,
}

/// Inbound events the orchestrator cares about. Everything else is dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    ResponseStarted,
    ResponseCompleted,
    Error { code: String, message: String },
    UtteranceCompleted(String),
    TranscriptDelta(String),
    AssistantTextDelta(String),
}

pub fn encode(command: &OutboundCommand) -> Result<String> {
    let event = match command {
        OutboundCommand::ConfigureSession { instructions, voice } => {
            ClientEvent::SessionUpdate(SessionUpdateEvent::new(session_config(instructions, voice)))
        }
        OutboundCommand::CreateUserTurn(text) => ClientEvent::ConversationItemCreate(
            ConversationItemCreateEvent::new(Item::Message(MessageItem::user_text(text))),
        ),
        OutboundCommand::RequestResponse => ClientEvent::ResponseCreate(ResponseCreateEvent::new()),
        OutboundCommand::CancelResponse => ClientEvent::ResponseCancel(ResponseCancelEvent::new()),
    };
    Ok(serde_json::to_string(&event)?)
}

// Responses are only ever requested explicitly, and listener speech must not cut the
// narration off on the server side; interruption is driven from our end.
fn session_config(instructions: &str, voice: &str) -> Session {
    let vad = ServerVadTurnDetection::default()
        .with_create_response(false)
        .with_interrupt_response(false);
    Session::new()
        .with_modalities_enable_audio()
        .with_instructions(instructions)
        .with_voice(Voice::from(voice))
        .with_input_audio_transcription_enable(TranscriptionModel::Whisper)
        .with_turn_detection_enable(TurnDetection::ServerVad(vad))
        .build()
}

/// Classify one inbound frame. Unknown types and malformed JSON yield `None`.
pub fn classify(text: &str) -> Option<ProtocolEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("dropping malformed realtime frame: {}", e);
            return None;
        }
    };
    let kind = value.get("type")?.as_str()?;

    match kind {
        server::RESPONSE_CREATED => Some(ProtocolEvent::ResponseStarted),
        server::RESPONSE_DONE | server::RESPONSE_COMPLETED => Some(ProtocolEvent::ResponseCompleted),
        server::ERROR => {
            let details = value
                .get("error")
                .cloned()
                .and_then(|e| serde_json::from_value::<ErrorDetails>(e).ok());
            let (code, message) = match details {
                Some(details) => (
                    details
                        .code()
                        .or(details.error_type())
                        .unwrap_or("unknown")
                        .to_string(),
                    details.message().to_string(),
                ),
                None => ("unknown".to_string(), String::new()),
            };
            Some(ProtocolEvent::Error { code, message })
        }
        server::INPUT_TRANSCRIPTION_COMPLETED => extract_transcript(&value)
            .filter(|t| !t.trim().is_empty())
            .map(|t| ProtocolEvent::UtteranceCompleted(t.trim().to_string())),
        server::INPUT_TRANSCRIPTION_DELTA => extract_transcript(&value)
            .filter(|t| !t.is_empty())
            .map(ProtocolEvent::TranscriptDelta),
        kind if server::ASSISTANT_TEXT_DELTAS.contains(&kind) => value
            .get("delta")
            .and_then(Value::as_str)
            .map(|d| ProtocolEvent::AssistantTextDelta(d.to_string())),
        _ => None,
    }
}

/// Transcription payloads arrive in several shapes; probe them in a fixed order.
pub fn extract_transcript(value: &Value) -> Option<String> {
    let direct = ["transcript", "delta"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .or_else(|| value.pointer("/data/transcript").and_then(Value::as_str));
    if let Some(text) = direct {
        return Some(text.to_string());
    }

    let parts = value.pointer("/item/content")?.as_array()?;
    ["transcript", "text"].iter().find_map(|key| {
        parts
            .iter()
            .find_map(|part| part.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    })
}

/// Sits between the orchestrator and the transport. Outbound commands are buffered
/// until the channel is writable and then flushed in submission order. Inbound frames
/// are classified, and the in-flight response flag plus the running assistant text are
/// tracked along the way.
///
/// A `response.create` counts as requested from the moment it is submitted until the
/// server either starts a response for it or rejects it.
pub struct ProtocolAdapter {
    transport: Arc<dyn Transport>,
    writable: bool,
    outbox: VecDeque<String>,
    response_active: bool,
    requested: usize,
    assistant_text: String,
}

impl ProtocolAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            writable: false,
            outbox: VecDeque::new(),
            response_active: false,
            requested: 0,
            assistant_text: String::new(),
        }
    }

    pub async fn send(&mut self, command: OutboundCommand) -> Result<()> {
        let frame = encode(&command)?;
        if command == OutboundCommand::RequestResponse {
            self.requested += 1;
        }
        if !self.writable || !self.outbox.is_empty() {
            tracing::debug!("channel not writable yet, queueing {:?}", command);
            self.outbox.push_back(frame);
            return self.flush().await;
        }
        self.transport.send_text(frame).await
    }

    pub async fn set_writable(&mut self, writable: bool) -> Result<()> {
        self.writable = writable;
        if writable {
            self.flush().await
        } else {
            Ok(())
        }
    }

    async fn flush(&mut self) -> Result<()> {
        while self.writable {
            let Some(frame) = self.outbox.pop_front() else {
                break;
            };
            if let Err(e) = self.transport.send_text(frame.clone()).await {
                self.outbox.push_front(frame);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn handle_inbound(&mut self, text: &str) -> Option<ProtocolEvent> {
        let event = classify(text)?;
        match &event {
            ProtocolEvent::ResponseStarted => {
                self.response_active = true;
                self.requested = self.requested.saturating_sub(1);
                self.assistant_text.clear();
            }
            ProtocolEvent::ResponseCompleted => self.response_active = false,
            ProtocolEvent::AssistantTextDelta(delta) => self.assistant_text.push_str(delta),
            // the rejected request will never start
            ProtocolEvent::Error { code, .. } if code == server::ACTIVE_RESPONSE_EXISTS => {
                self.requested = self.requested.saturating_sub(1);
            }
            _ => {}
        }
        Some(event)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn response_active(&self) -> bool {
        self.response_active
    }

    /// Requested responses the server has not started yet.
    pub fn requests_outstanding(&self) -> usize {
        self.requested
    }

    /// True while a response is running or one has been requested and not yet started.
    pub fn response_in_flight(&self) -> bool {
        self.response_active || self.requested > 0
    }

    /// Forget the in-flight response, e.g. after a timeout or a forced cancel.
    pub fn clear_response_active(&mut self) {
        self.response_active = false;
        self.requested = 0;
    }

    pub fn assistant_text(&self) -> &str {
        &self.assistant_text
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Drop everything tied to the current connection.
    pub fn reset(&mut self) {
        self.writable = false;
        self.outbox.clear();
        self.response_active = false;
        self.requested = 0;
        self.assistant_text.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn session_config_disables_server_side_turns() {
        let frame = encode(&OutboundCommand::ConfigureSession {
            instructions: "Narrate.".into(),
            voice: "marin".into(),
        })
        .unwrap();
        let json: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["voice"], "marin");
        assert_eq!(json["session"]["instructions"], "Narrate.");
        assert_eq!(json["session"]["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(json["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(json["session"]["turn_detection"]["create_response"], false);
        assert_eq!(json["session"]["turn_detection"]["interrupt_response"], false);
    }

    #[test]
    fn transcript_shapes_are_probed_in_order() {
        assert_eq!(
            extract_transcript(&json!({"transcript": "top", "delta": "d"})).as_deref(),
            Some("top")
        );
        assert_eq!(
            extract_transcript(&json!({"data": {"transcript": "nested"}})).as_deref(),
            Some("nested")
        );
        assert_eq!(
            extract_transcript(&json!({"item": {"content": [
                {"type": "input_audio"},
                {"type": "input_audio", "transcript": "from item"}
            ]}}))
            .as_deref(),
            Some("from item")
        );
        assert_eq!(
            extract_transcript(&json!({"item": {"content": [{"text": "typed"}]}})).as_deref(),
            Some("typed")
        );
        assert_eq!(extract_transcript(&json!({"item": {}})), None);
    }

    #[test]
    fn classifies_the_events_that_matter() {
        assert_eq!(
            classify(r#"{"type":"response.created"}"#),
            Some(ProtocolEvent::ResponseStarted)
        );
        assert_eq!(
            classify(r#"{"type":"response.done"}"#),
            Some(ProtocolEvent::ResponseCompleted)
        );
        assert_eq!(
            classify(
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"  what is ATP? "}"#
            ),
            Some(ProtocolEvent::UtteranceCompleted("what is ATP?".into()))
        );
        assert_eq!(
            classify(r#"{"type":"response.output_audio_transcript.delta","delta":"Hi"}"#),
            Some(ProtocolEvent::AssistantTextDelta("Hi".into()))
        );
        assert_eq!(
            classify(r#"{"type":"error","error":{"type":"invalid_request_error","code":"response_cancel_not_active","message":"nothing to cancel"}}"#),
            Some(ProtocolEvent::Error {
                code: "response_cancel_not_active".into(),
                message: "nothing to cancel".into()
            })
        );
        assert_eq!(classify(r#"{"type":"session.updated"}"#), None);
        assert_eq!(classify("not json"), None);
    }

    #[test]
    fn empty_utterance_is_dropped() {
        assert_eq!(
            classify(r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"  "}"#),
            None
        );
    }

    #[test]
    fn error_without_code_falls_back_to_type() {
        assert_eq!(
            classify(r#"{"type":"error","error":{"type":"server_error","message":"boom"}}"#),
            Some(ProtocolEvent::Error {
                code: "server_error".into(),
                message: "boom".into()
            })
        );
    }

    #[tokio::test]
    async fn commands_queue_until_writable_then_flush_in_order() {
        let sent = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = sent.clone();
        let mut transport = MockTransport::new();
        transport.expect_send_text().times(3).returning(move |text| {
            sink.lock().unwrap().push(text);
            Ok(())
        });
        let mut adapter = ProtocolAdapter::new(Arc::new(transport));

        adapter
            .send(OutboundCommand::CreateUserTurn("chunk zero".into()))
            .await
            .unwrap();
        adapter.send(OutboundCommand::RequestResponse).await.unwrap();
        assert_eq!(adapter.queued(), 2);
        assert!(sent.lock().unwrap().is_empty());

        adapter.set_writable(true).await.unwrap();
        adapter.send(OutboundCommand::CancelResponse).await.unwrap();

        let types: Vec<String> = sent
            .lock()
            .unwrap()
            .iter()
            .map(|frame| {
                let json: Value = serde_json::from_str(frame).unwrap();
                json["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            types,
            ["conversation.item.create", "response.create", "response.cancel"]
        );
        assert_eq!(adapter.queued(), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_frame() {
        let mut transport = MockTransport::new();
        transport
            .expect_send_text()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("socket closed")));
        let mut adapter = ProtocolAdapter::new(Arc::new(transport));

        adapter.send(OutboundCommand::RequestResponse).await.unwrap();
        assert!(adapter.set_writable(true).await.is_err());
        assert_eq!(adapter.queued(), 1);
    }

    #[test]
    fn inbound_tracks_response_and_answer_text() {
        let mut adapter = ProtocolAdapter::new(Arc::new(MockTransport::new()));

        adapter.handle_inbound(r#"{"type":"response.created"}"#);
        assert!(adapter.response_active());
        adapter.handle_inbound(r#"{"type":"response.text.delta","delta":"Mito"}"#);
        adapter.handle_inbound(r#"{"type":"response.text.delta","delta":"chondria"}"#);
        assert_eq!(adapter.assistant_text(), "Mitochondria");

        adapter.handle_inbound(r#"{"type":"response.done"}"#);
        assert!(!adapter.response_active());
        assert_eq!(adapter.assistant_text(), "Mitochondria");

        adapter.handle_inbound(r#"{"type":"response.created"}"#);
        assert_eq!(adapter.assistant_text(), "");
    }

    #[tokio::test]
    async fn requested_response_is_in_flight_before_it_starts() {
        let mut transport = MockTransport::new();
        transport.expect_send_text().returning(|_| Ok(()));
        let mut adapter = ProtocolAdapter::new(Arc::new(transport));
        adapter.set_writable(true).await.unwrap();

        adapter.send(OutboundCommand::RequestResponse).await.unwrap();
        assert!(!adapter.response_active());
        assert!(adapter.response_in_flight());

        adapter.send(OutboundCommand::RequestResponse).await.unwrap();
        adapter.handle_inbound(r#"{"type":"response.created"}"#);
        assert_eq!(adapter.requests_outstanding(), 1);

        // the second request loses the race and is rejected
        adapter.handle_inbound(
            r#"{"type":"error","error":{"code":"conversation_already_has_active_response","message":"busy"}}"#,
        );
        assert_eq!(adapter.requests_outstanding(), 0);

        adapter.handle_inbound(r#"{"type":"response.done"}"#);
        assert!(!adapter.response_in_flight());
    }
}

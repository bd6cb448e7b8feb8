use crate::error::ContentError;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use secrecy::SecretString;
use serde::Deserialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LectureDetail {
    pub lecture_id: String,
    pub title: String,
    #[serde(default)]
    pub status: String,
    pub num_chunks: usize,
    #[serde(default)]
    pub duration_estimate: Option<u32>,
    #[serde(default)]
    pub chunks_ready: bool,
}

/// One narration unit, sized to be spoken in a single model response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Chunk {
    pub chunk_id: u64,
    pub text: String,
    pub approx_seconds: u32,
    #[serde(default)]
    pub section_name: Option<String>,
    #[serde(default)]
    pub spoken_math: Option<Vec<String>>,
    #[serde(default)]
    pub source_refs: Option<Vec<String>>,
}

/// A freshly minted realtime credential and the session parameters it came with.
#[derive(Debug, Clone)]
pub struct RealtimeToken {
    pub secret: SecretString,
    pub expires_at: i64,
    pub model: String,
    pub voice: String,
}

#[derive(Debug, Deserialize)]
struct ChunkEnvelope {
    chunk: Chunk,
}

#[derive(Deserialize)]
struct ContextEnvelope {
    context_text: String,
}

#[derive(Deserialize)]
struct InstructionsEnvelope {
    instructions: String,
}

#[derive(Deserialize)]
struct TokenEnvelope {
    client_secret: ClientSecret,
    realtime_model: String,
    voice: String,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: String,
    #[serde(default)]
    expires_at: i64,
}

/// Read side of the lecture backend. Every call is independent and may be retried.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContentService: Send + Sync {
    async fn fetch_lecture(&self, lecture_id: &str) -> Result<LectureDetail, ContentError>;

    /// `NotFound` means the index is past the end of the lecture.
    async fn fetch_chunk(&self, lecture_id: &str, index: usize) -> Result<Chunk, ContentError>;

    /// Narration preceding `index`, bounded to roughly `window_secs` of speech.
    async fn fetch_context(
        &self,
        lecture_id: &str,
        index: usize,
        window_secs: u32,
    ) -> Result<String, ContentError>;

    async fn fetch_instructions(&self, lecture_id: &str) -> Result<String, ContentError>;

    async fn mint_token(&self, lecture_id: &str) -> Result<RealtimeToken, ContentError>;
}

/// `ContentService` over the lecture backend's JSON REST API.
pub struct HttpContentService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContentService {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn lecture_url(&self, lecture_id: &str, suffix: &str) -> String {
        format!("{}/lectures/{}{}", self.base_url, lecture_id, suffix)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, ContentError> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        decode_response(status, &body, what)
    }
}

/// Map an HTTP status and body onto the content error taxonomy.
pub(crate) fn decode_response<T: DeserializeOwned>(
    status: u16,
    body: &str,
    what: &str,
) -> Result<T, ContentError> {
    if status == 404 {
        return Err(ContentError::NotFound(what.to_string()));
    }
    if !(200..300).contains(&status) {
        return Err(ContentError::Status {
            status,
            body: body.to_string(),
        });
    }
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl ContentService for HttpContentService {
    async fn fetch_lecture(&self, lecture_id: &str) -> Result<LectureDetail, ContentError> {
        let request = self.client.get(self.lecture_url(lecture_id, ""));
        self.execute(request, &format!("lecture {lecture_id}")).await
    }

    async fn fetch_chunk(&self, lecture_id: &str, index: usize) -> Result<Chunk, ContentError> {
        let request = self
            .client
            .get(self.lecture_url(lecture_id, "/chunk"))
            .query(&[("index", index)]);
        let envelope: ChunkEnvelope = self.execute(request, &format!("chunk {index}")).await?;
        Ok(envelope.chunk)
    }

    async fn fetch_context(
        &self,
        lecture_id: &str,
        index: usize,
        window_secs: u32,
    ) -> Result<String, ContentError> {
        let request = self
            .client
            .get(self.lecture_url(lecture_id, "/context"))
            .query(&[("index", index), ("window", window_secs as usize)]);
        let envelope: ContextEnvelope = self
            .execute(request, &format!("context before chunk {index}"))
            .await?;
        Ok(envelope.context_text)
    }

    async fn fetch_instructions(&self, lecture_id: &str) -> Result<String, ContentError> {
        let request = self
            .client
            .get(self.lecture_url(lecture_id, "/realtime-instructions"));
        let envelope: InstructionsEnvelope = self.execute(request, "realtime instructions").await?;
        Ok(envelope.instructions)
    }

    async fn mint_token(&self, lecture_id: &str) -> Result<RealtimeToken, ContentError> {
        let request = self
            .client
            .post(self.lecture_url(lecture_id, "/realtime-token"));
        let envelope: TokenEnvelope = self.execute(request, "realtime token").await?;
        tracing::debug!(
            model = %envelope.realtime_model,
            expires_at = envelope.client_secret.expires_at,
            "minted realtime credential"
        );
        Ok(RealtimeToken {
            secret: SecretString::from(envelope.client_secret.value),
            expires_at: envelope.client_secret.expires_at,
            model: envelope.realtime_model,
            voice: envelope.voice,
        })
    }
}

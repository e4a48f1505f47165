use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key the engine inspects to tell agent speech from user audio.
pub const AGENT_RESPONSE_KEY: &str = "isAgentResponse";

/// Audio handed to the queue as an opaque blob.
///
/// The backend materialises it as a temporary resource owned by the unit
/// for the duration of its playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlob {
    pub bytes: Bytes,
    pub mime: Option<String>,
}

impl AudioBlob {
    pub fn new(bytes: impl Into<Bytes>, mime: Option<&str>) -> Self {
        Self {
            bytes: bytes.into(),
            mime: mime.map(str::to_string),
        }
    }

    /// File extension matching the mime type, used as a decoder hint.
    pub fn extension(&self) -> Option<&'static str> {
        match self.mime.as_deref()? {
            "audio/mpeg" | "audio/mp3" => Some("mp3"),
            "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
            "audio/ogg" | "audio/vorbis" => Some("ogg"),
            "audio/flac" | "audio/x-flac" => Some("flac"),
            "audio/aac" => Some("aac"),
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
            _ => None,
        }
    }
}

/// The closed set of representations a unit can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPayload {
    /// Remote URL, `file://` URL or local path
    Url(String),
    Blob(AudioBlob),
    /// Raw encoded bytes, decoded in full before scheduling
    Encoded(Bytes),
}

impl AudioPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            AudioPayload::Url(_) => "url",
            AudioPayload::Blob(_) => "blob",
            AudioPayload::Encoded(_) => "encoded",
        }
    }
}

/// Open key-value bag attached to units and streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata marking audio as the agent's voice.
    pub fn agent() -> Self {
        Self::new().with(AGENT_RESPONSE_KEY, true)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_agent_response(&self) -> bool {
        self.0
            .get(AGENT_RESPONSE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// One schedulable audio item.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    pub id: String,
    pub payload: AudioPayload,
    /// Higher plays earlier; ties keep arrival order
    pub priority: i32,
    pub metadata: Metadata,
}

impl PlaybackUnit {
    /// Creates a unit with a generated id and priority 0.
    pub fn new(payload: AudioPayload) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: AudioPayload) -> Self {
        Self {
            id: id.into(),
            payload,
            priority: 0,
            metadata: Metadata::default(),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_agent_response(&self) -> bool {
        self.metadata.is_agent_response()
    }
}

impl std::fmt::Display for PlaybackUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] (priority {}{})",
            self.id,
            self.payload.kind(),
            self.priority,
            if self.is_agent_response() { ", agent" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_flag_from_metadata() {
        assert!(Metadata::agent().is_agent_response());
        assert!(!Metadata::new().is_agent_response());
        assert!(!Metadata::new().with(AGENT_RESPONSE_KEY, "yes").is_agent_response());
    }

    #[test]
    fn test_metadata_serializes_as_plain_object() {
        let meta = Metadata::agent().with("messageId", "m-1");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["isAgentResponse"], true);
        assert_eq!(json["messageId"], "m-1");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = PlaybackUnit::new(AudioPayload::Url("a.mp3".into()));
        let b = PlaybackUnit::new(AudioPayload::Url("a.mp3".into()));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_blob_extension_hint() {
        assert_eq!(AudioBlob::new(vec![0u8; 4], Some("audio/mpeg")).extension(), Some("mp3"));
        assert_eq!(AudioBlob::new(vec![0u8; 4], None).extension(), None);
    }

    #[test]
    fn test_display() {
        let unit = PlaybackUnit::with_id("u1", AudioPayload::Encoded(Bytes::from_static(b"x")))
            .priority(10)
            .metadata(Metadata::agent());
        assert_eq!(unit.to_string(), "u1 [encoded] (priority 10, agent)");
    }
}

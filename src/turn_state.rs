//! Agent turn-state plumbing
//!
//! The RTC layer delivers the agent's turn state, subtitles and tool calls
//! as binary room messages framed as TLV:
//!
//! ```text
//! +--------+----------------+----------------------+
//! | tag    | length (u32 BE)| value (UTF-8 JSON)   |
//! | 4 byte | 4 byte         | `length` bytes       |
//! +--------+----------------+----------------------+
//! ```
//!
//! [`TurnStateRouter`] turns those messages, and the remote capture
//! start/stop events, into speaking triggers on a [`StreamManager`].

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use crate::error::{AudioError, Result};
use crate::stream_manager::StreamManager;

pub const TAG_BRIEF: [u8; 4] = *b"conv";
pub const TAG_SUBTITLE: [u8; 4] = *b"subv";
pub const TAG_TOOL_CALL: [u8; 4] = *b"tool";
pub const TAG_TOOL_REPLY: [u8; 4] = *b"func";
pub const TAG_COMMAND: [u8; 4] = *b"ctrl";

const HEADER_LEN: usize = 8;

/// Participant id fragments that identify the agent in capture events.
pub const DEFAULT_AGENT_MARKERS: [&str; 2] = ["RobotMan_", "Bot"];

/// One decoded TLV frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub tag: [u8; 4],
    pub value: String,
}

impl Frame {
    pub fn new(tag: [u8; 4], value: impl Into<String>) -> Self {
        Self { tag, value: value.into() }
    }

    pub fn tag_str(&self) -> &str {
        std::str::from_utf8(&self.tag).unwrap_or("????")
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.value.len());
        buf.put_slice(&self.tag);
        buf.put_u32(self.value.len() as u32);
        buf.put_slice(self.value.as_bytes());
        buf.freeze()
    }

    /// Decodes a frame. Bytes past the declared length are ignored.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(AudioError::Frame(format!("frame too short: {} bytes", buf.len())));
        }

        let mut tag = [0u8; 4];
        buf.copy_to_slice(&mut tag);
        if !tag.iter().all(u8::is_ascii_graphic) {
            return Err(AudioError::Frame(format!("invalid frame tag {:02x?}", tag)));
        }

        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(AudioError::Frame(format!(
                "frame declares {} bytes but carries {}",
                len,
                buf.remaining()
            )));
        }

        let value = std::str::from_utf8(&buf[..len])
            .map_err(|e| AudioError::Frame(format!("frame value is not UTF-8: {}", e)))?;
        Ok(Self::new(tag, value))
    }
}

/// Agent turn stage carried by `conv` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum AgentBrief {
    Unknown = 0,
    Listening = 1,
    Thinking = 2,
    Speaking = 3,
    Interrupted = 4,
    Finished = 5,
}

impl AgentBrief {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => AgentBrief::Listening,
            2 => AgentBrief::Thinking,
            3 => AgentBrief::Speaking,
            4 => AgentBrief::Interrupted,
            5 => AgentBrief::Finished,
            _ => AgentBrief::Unknown,
        }
    }

    /// The speaking trigger this stage implies, if any.
    pub fn speaking_trigger(self) -> Option<bool> {
        match self {
            AgentBrief::Speaking => Some(true),
            AgentBrief::Finished | AgentBrief::Interrupted => Some(false),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtitle {
    #[serde(default)]
    pub text: String,
    /// Whether the recognition result is final
    #[serde(default)]
    pub definite: bool,
    #[serde(default)]
    pub user_id: String,
    /// Whether the text closes a paragraph
    #[serde(default)]
    pub paragraph: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnMessage {
    Brief {
        stage: AgentBrief,
        description: Option<String>,
    },
    Subtitle(Subtitle),
    ToolCall(ToolCall),
    /// Well-formed frame with a tag this crate does not interpret
    Other(Frame),
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BriefBody {
    stage: Option<StageBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StageBody {
    code: Option<i64>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct SubtitleBody {
    #[serde(default)]
    data: Vec<Subtitle>,
}

#[derive(Deserialize)]
struct ToolCallBody {
    #[serde(default)]
    tool_calls: Vec<ToolCallEntry>,
}

#[derive(Deserialize)]
struct ToolCallEntry {
    #[serde(default)]
    id: String,
    function: ToolFunction,
}

#[derive(Deserialize)]
struct ToolFunction {
    name: String,
    arguments: Option<String>,
}

fn json_error(tag: &str, e: serde_json::Error) -> AudioError {
    AudioError::Frame(format!("malformed {} body: {}", tag, e))
}

/// Decodes a binary room message into a turn message.
pub fn parse_message(buf: &[u8]) -> Result<TurnMessage> {
    let frame = Frame::decode(buf)?;

    match frame.tag {
        TAG_BRIEF => {
            let body: BriefBody = serde_json::from_str(&frame.value).map_err(|e| json_error("conv", e))?;
            let stage = body.stage.unwrap_or(StageBody { code: None, description: None });
            Ok(TurnMessage::Brief {
                stage: stage.code.map(AgentBrief::from_code).unwrap_or(AgentBrief::Unknown),
                description: stage.description,
            })
        }
        TAG_SUBTITLE => {
            let body: SubtitleBody = serde_json::from_str(&frame.value).map_err(|e| json_error("subv", e))?;
            let subtitle = body
                .data
                .into_iter()
                .next()
                .ok_or_else(|| AudioError::Frame("subtitle frame without data".into()))?;
            Ok(TurnMessage::Subtitle(subtitle))
        }
        TAG_TOOL_CALL => {
            let body: ToolCallBody = serde_json::from_str(&frame.value).map_err(|e| json_error("tool", e))?;
            let call = body
                .tool_calls
                .into_iter()
                .next()
                .ok_or_else(|| AudioError::Frame("tool frame without tool_calls".into()))?;
            Ok(TurnMessage::ToolCall(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            }))
        }
        _ => Ok(TurnMessage::Other(frame)),
    }
}

/// Frame answering a tool call.
pub fn encode_tool_reply(tool_call_id: &str, content: &str) -> Bytes {
    let value = json!({ "ToolCallID": tool_call_id, "Content": content });
    Frame::new(TAG_TOOL_REPLY, value.to_string()).encode()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCommand {
    Interrupt,
    ExternalTextToSpeech,
    ExternalTextToLlm,
}

impl AgentCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentCommand::Interrupt => "interrupt",
            AgentCommand::ExternalTextToSpeech => "ExternalTextToSpeech",
            AgentCommand::ExternalTextToLlm => "ExternalTextToLLM",
        }
    }
}

/// How an injected command competes with the turn in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum InterruptPriority {
    #[default]
    None = 0,
    /// Interrupts the current turn
    High = 1,
    /// Waits for the current turn to end
    Medium = 2,
    /// Dropped if a turn is in progress
    Low = 3,
}

/// Control frame sent to the agent.
pub fn encode_command(command: AgentCommand, priority: InterruptPriority, message: &str) -> Bytes {
    let value = json!({
        "Command": command.as_str(),
        "InterruptMode": priority as u8,
        "Message": message,
    });
    Frame::new(TAG_COMMAND, value.to_string()).encode()
}

/// Remote audio capture notifications from the RTC layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Started { user_id: String },
    Stopped { user_id: String },
}

/// Feeds turn-state messages and capture events into a [`StreamManager`].
pub struct TurnStateRouter {
    manager: Arc<StreamManager>,
    agent_markers: Vec<String>,
}

impl TurnStateRouter {
    pub fn new(manager: Arc<StreamManager>, agent_markers: Vec<String>) -> Self {
        Self { manager, agent_markers }
    }

    pub fn is_agent(&self, user_id: &str) -> bool {
        self.agent_markers.iter().any(|m| user_id.contains(m.as_str()))
    }

    /// Handles one binary room message. Malformed frames are dropped;
    /// decoded messages are returned for the caller's own use (subtitles,
    /// tool calls).
    pub fn handle_binary(&self, buf: &[u8]) -> Option<TurnMessage> {
        let message = match parse_message(buf) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring malformed room message: {}", e);
                return None;
            }
        };

        if let TurnMessage::Brief { stage, description } = &message {
            debug!(?stage, description = description.as_deref().unwrap_or(""), "Agent turn state");
            if let Some(speaking) = stage.speaking_trigger() {
                self.manager.trigger_speaking_state(speaking);
            }
        }
        Some(message)
    }

    pub fn handle_capture(&self, event: &CaptureEvent) {
        let (user_id, speaking) = match event {
            CaptureEvent::Started { user_id } => (user_id, true),
            CaptureEvent::Stopped { user_id } => (user_id, false),
        };
        if !self.is_agent(user_id) {
            trace!(user_id = %user_id, "Capture event from a non-agent participant");
            return;
        }
        debug!(user_id = %user_id, speaking, "Agent capture event");
        self.manager.trigger_speaking_state(speaking);
    }
}

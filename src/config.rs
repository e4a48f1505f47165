//! Settings file

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio_queue::{QueueOptions, DEFAULT_MAX_QUEUE_SIZE};
use crate::stream_manager::{
    StreamOptions, DEFAULT_AGENT_PRIORITY, DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_STREAM_QUEUE_SIZE,
    DEFAULT_STREAM_TIMEOUT, DEFAULT_USER_PRIORITY,
};
use crate::turn_state::DEFAULT_AGENT_MARKERS;

pub const DEFAULT_CONFIG_FILE: &str = "catvoice.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Pending units kept by a standalone queue; 0 disables the bound
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default)]
    pub settle_delay_ms: u64,
}

fn default_max_queue_size() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            settle_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    #[serde(default = "default_agent_priority")]
    pub agent_priority: i32,
    #[serde(default = "default_user_priority")]
    pub user_priority: i32,
    /// Capacity of the manager's own queue
    #[serde(default = "default_stream_queue_size")]
    pub max_queue_size: usize,
}

fn default_max_concurrent_streams() -> usize {
    DEFAULT_MAX_CONCURRENT_STREAMS
}

fn default_stream_timeout_ms() -> u64 {
    DEFAULT_STREAM_TIMEOUT.as_millis() as u64
}

fn default_agent_priority() -> i32 {
    DEFAULT_AGENT_PRIORITY
}

fn default_user_priority() -> i32 {
    DEFAULT_USER_PRIORITY
}

fn default_stream_queue_size() -> usize {
    DEFAULT_STREAM_QUEUE_SIZE
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            stream_timeout_ms: default_stream_timeout_ms(),
            agent_priority: default_agent_priority(),
            user_priority: default_user_priority(),
            max_queue_size: default_stream_queue_size(),
        }
    }
}

fn default_agent_markers() -> Vec<String> {
    DEFAULT_AGENT_MARKERS.iter().map(|m| m.to_string()).collect()
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub streams: StreamSettings,
    /// Participant id fragments that identify the agent
    #[serde(default = "default_agent_markers")]
    pub agent_markers: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            streams: StreamSettings::default(),
            agent_markers: default_agent_markers(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        fs::write(path, content).with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.streams.max_concurrent_streams == 0 {
            bail!("streams.max_concurrent_streams must be at least 1");
        }
        if self.agent_markers.iter().any(|m| m.is_empty()) {
            bail!("agent_markers cannot contain empty strings");
        }
        Ok(())
    }

    /// Options for a standalone queue.
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_queue_size: self.queue.max_queue_size,
            settle_delay: Duration::from_millis(self.queue.settle_delay_ms),
        }
    }

    /// Options for a stream manager and its internal queue.
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            max_concurrent_streams: self.streams.max_concurrent_streams,
            stream_timeout: Duration::from_millis(self.streams.stream_timeout_ms),
            agent_priority: self.streams.agent_priority,
            user_priority: self.streams.user_priority,
            queue: QueueOptions {
                max_queue_size: self.streams.max_queue_size,
                settle_delay: Duration::from_millis(self.queue.settle_delay_ms),
            },
        }
    }
}

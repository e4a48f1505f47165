//! Error types for catvoice
//!
//! Every variant carries a string so errors can be cloned into both the
//! play-end outcome and the error notification of the same unit.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Payload could not be decoded
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Payload shape the backend has no strategy for
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Output device missing or refused to start (the desktop analogue of
    /// an autoplay-policy rejection)
    #[error("Audio output error: {0}")]
    Output(String),

    /// Playback failed after it started
    #[error("Playback error: {0}")]
    Playback(String),

    /// Remote payload could not be fetched
    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("File I/O error: {0}")]
    Io(String),

    /// Stream exceeded its wall-clock budget
    #[error("Stream timed out after {0} ms")]
    Timeout(u64),

    /// Malformed binary message frame
    #[error("Invalid frame: {0}")]
    Frame(String),

    /// Service already torn down
    #[error("Audio service shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, AudioError>;

impl From<std::io::Error> for AudioError {
    fn from(e: std::io::Error) -> Self {
        AudioError::Io(e.to_string())
    }
}

impl From<symphonia::core::errors::Error> for AudioError {
    fn from(e: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error as SymphoniaError;
        match e {
            SymphoniaError::Unsupported(what) => AudioError::UnsupportedFormat(what.to_string()),
            SymphoniaError::IoError(io) => AudioError::Io(io.to_string()),
            other => AudioError::Decode(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AudioError {
    fn from(e: reqwest::Error) -> Self {
        AudioError::Fetch(e.to_string())
    }
}

impl From<rodio::decoder::DecoderError> for AudioError {
    fn from(e: rodio::decoder::DecoderError) -> Self {
        AudioError::Decode(e.to_string())
    }
}

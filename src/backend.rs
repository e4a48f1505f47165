//! Playback backend seam
//!
//! The queue and the stream manager never touch an audio device directly.
//! They ask a [`PlaybackBackend`] to start a unit and get back a
//! [`Playback`]: a control handle plus a one-shot completion. Every path
//! (URL, blob, encoded buffer, live stream) converges on that contract.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::playback_unit::PlaybackUnit;

/// Resolves exactly once when rendering ends on its own, with the error
/// if it ended badly. Dropping the sender counts as a failure.
pub type Completion = oneshot::Receiver<Result<()>>;

/// Handle over one started playback.
#[async_trait]
pub trait PlaybackControl: Send {
    fn pause(&mut self);

    fn resume(&mut self) -> Result<()>;

    /// Immediate stop. Completion may or may not fire afterwards.
    fn halt(&mut self);

    /// Releases per-unit resources (temp files, sinks). Called once on
    /// every exit path and awaited before the next unit starts.
    async fn release(&mut self);
}

pub struct Playback {
    pub control: Box<dyn PlaybackControl>,
    pub done: Completion,
}

impl Playback {
    pub fn new(control: Box<dyn PlaybackControl>, done: Completion) -> Self {
        Self { control, done }
    }
}

/// Continuous PCM source, e.g. a remote participant's audio track.
/// The stream ends when every sender has been dropped.
#[derive(Debug)]
pub struct LiveStream {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: mpsc::Receiver<Vec<f32>>,
}

impl LiveStream {
    /// Creates a live stream and the sender that feeds it interleaved frames.
    pub fn channel(sample_rate: u32, channels: u16, buffer: usize) -> (mpsc::Sender<Vec<f32>>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { sample_rate, channels, frames: rx })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    /// Decodes the unit's payload and starts rendering it.
    async fn start(&self, unit: &PlaybackUnit) -> Result<Playback>;

    /// Starts rendering a live stream outside the queue.
    async fn start_live(&self, stream: LiveStream) -> Result<Playback>;

    /// Whether the shared output/decoding context exists.
    fn has_output(&self) -> bool;

    /// Tears down the shared output context.
    async fn close(&self);
}

//! Device-less backend
//!
//! Renders nothing but keeps real timing: each unit "plays" for the
//! duration its container declares (or a fixed fallback), so the whole
//! pipeline can run on machines without an audio device.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::backend::{LiveStream, Playback, PlaybackBackend, PlaybackControl};
use crate::decode::{extension_hint, probe_duration};
use crate::error::{AudioError, Result};
use crate::playback_unit::{AudioPayload, PlaybackUnit};

pub const DEFAULT_FALLBACK_DURATION: Duration = Duration::from_secs(2);

pub struct SimulatedBackend {
    fallback: Duration,
    opened: AtomicBool,
}

impl SimulatedBackend {
    pub fn new(fallback: Duration) -> Self {
        Self {
            fallback,
            opened: AtomicBool::new(false),
        }
    }

    async fn payload_bytes(payload: &AudioPayload) -> Result<Option<(Bytes, Option<String>)>> {
        match payload {
            AudioPayload::Url(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(None),
            AudioPayload::Url(url) => {
                let path = url.strip_prefix("file://").unwrap_or(url);
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| AudioError::Io(format!("Failed to read {}: {}", path, e)))?;
                Ok(Some((Bytes::from(bytes), extension_hint(path).map(str::to_string))))
            }
            AudioPayload::Blob(blob) => Ok(Some((blob.bytes.clone(), blob.extension().map(str::to_string)))),
            AudioPayload::Encoded(bytes) => Ok(Some((bytes.clone(), None))),
        }
    }

    async fn duration_of(&self, payload: &AudioPayload) -> Result<Duration> {
        let Some((bytes, ext)) = Self::payload_bytes(payload).await? else {
            return Ok(self.fallback);
        };
        let secs = probe_duration(bytes, ext.as_deref())?;
        Ok(secs.map(Duration::from_secs_f64).unwrap_or(self.fallback))
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_DURATION)
    }
}

/// Sleeps through the remaining duration, stopping the clock while paused.
async fn run_clock(mut remaining: Duration, mut paused: watch::Receiver<bool>, done: oneshot::Sender<Result<()>>) {
    loop {
        if *paused.borrow() {
            if paused.changed().await.is_err() {
                return;
            }
            continue;
        }
        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {
                let _ = done.send(Ok(()));
                return;
            }
            changed = paused.changed() => {
                if changed.is_err() {
                    return;
                }
                remaining = remaining.saturating_sub(started.elapsed());
            }
        }
    }
}

struct SimulatedControl {
    paused: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    halted: bool,
}

#[async_trait]
impl PlaybackControl for SimulatedControl {
    fn pause(&mut self) {
        let _ = self.paused.send(true);
    }

    fn resume(&mut self) -> Result<()> {
        if self.halted {
            return Err(AudioError::Playback("playback already halted".into()));
        }
        let _ = self.paused.send(false);
        Ok(())
    }

    fn halt(&mut self) {
        self.halted = true;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    async fn release(&mut self) {
        self.halt();
    }
}

#[async_trait]
impl PlaybackBackend for SimulatedBackend {
    async fn start(&self, unit: &PlaybackUnit) -> Result<Playback> {
        self.opened.store(true, Ordering::SeqCst);
        let duration = self.duration_of(&unit.payload).await?;
        debug!(unit_id = %unit.id, ?duration, "Simulating playback");

        let (paused_tx, paused_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(run_clock(duration, paused_rx, done_tx));

        let control = SimulatedControl {
            paused: paused_tx,
            task: Some(task),
            halted: false,
        };
        Ok(Playback::new(Box::new(control), done_rx))
    }

    async fn start_live(&self, mut stream: LiveStream) -> Result<Playback> {
        self.opened.store(true, Ordering::SeqCst);
        let (paused_tx, _paused_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            while stream.frames.recv().await.is_some() {}
            let _ = done_tx.send(Ok(()));
        });

        let control = SimulatedControl {
            paused: paused_tx,
            task: Some(task),
            halted: false,
        };
        Ok(Playback::new(Box::new(control), done_rx))
    }

    fn has_output(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.opened.store(false, Ordering::SeqCst);
    }
}

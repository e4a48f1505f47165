use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::audio_queue::{AudioQueue, QueueCommand};
use crate::backend::{Playback, PlaybackBackend};
use crate::error::AudioError;
use crate::playback_unit::PlaybackUnit;

/// How a dequeued unit left the queue. Exactly one per unit.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackOutcome {
    Completed,
    Skipped,
    Stopped,
    Failed(AudioError),
}

impl PlaybackOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PlaybackOutcome::Failed(_))
    }
}

/// Lifecycle notifications emitted by the drain task.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    PlayStart(PlaybackUnit),
    PlayEnd {
        unit: PlaybackUnit,
        outcome: PlaybackOutcome,
    },
    /// A unit finished and nothing was left pending
    QueueEmpty,
    /// Failure tied to a unit: decode/playback errors and refused resumes
    Error {
        unit_id: Option<String>,
        error: AudioError,
    },
    /// Pending unit dropped to respect the capacity bound
    Evicted(PlaybackUnit),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Flow {
    Continue,
    Shutdown,
}

/// How the backend's start call ended.
enum Start {
    Playing { playback: Playback, paused: bool },
    Failed(AudioError),
    /// A command ended the unit before the backend finished starting it
    Cancelled(PlaybackOutcome, Flow),
}

/// Drains the queue one unit at a time.
pub struct QueueProcessor {
    queue: Arc<Mutex<AudioQueue>>,
    backend: Arc<dyn PlaybackBackend>,
    commands: UnboundedReceiver<QueueCommand>,
    events: UnboundedSender<QueueEvent>,
    settle_delay: Duration,
}

impl QueueProcessor {
    pub(crate) fn new(
        queue: Arc<Mutex<AudioQueue>>,
        backend: Arc<dyn PlaybackBackend>,
        commands: UnboundedReceiver<QueueCommand>,
        events: UnboundedSender<QueueEvent>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            queue,
            backend,
            commands,
            events,
            settle_delay,
        }
    }

    fn queue(&self) -> MutexGuard<'_, AudioQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    pub async fn run(mut self) {
        loop {
            let next = self.queue().begin_next();
            match next {
                Some(unit) => {
                    if self.play(unit).await == Flow::Shutdown {
                        break;
                    }
                }
                None => match self.commands.recv().await {
                    None | Some(QueueCommand::Shutdown) => break,
                    Some(command) => trace!(?command, "Idle queue woke up"),
                },
            }
        }
        debug!("Audio queue drain task stopped");
    }

    async fn play(&mut self, unit: PlaybackUnit) -> Flow {
        debug!(unit_id = %unit.id, payload = unit.payload.kind(), "Audio playback started");
        self.emit(QueueEvent::PlayStart(unit.clone()));

        let (outcome, flow) = match self.start(&unit).await {
            Start::Playing { playback, paused } => self.supervise(&unit, playback, paused).await,
            Start::Failed(e) => (PlaybackOutcome::Failed(e), Flow::Continue),
            Start::Cancelled(outcome, flow) => (outcome, flow),
        };

        self.complete(unit, outcome);

        if flow == Flow::Continue && !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        flow
    }

    /// Asks the backend to start `unit` while still reading commands.
    /// Skip, stop and shutdown drop the pending start; pause and resume
    /// are applied once playback exists.
    async fn start(&mut self, unit: &PlaybackUnit) -> Start {
        let backend = self.backend.clone();
        let start = backend.start(unit);
        tokio::pin!(start);
        let mut paused = false;

        loop {
            tokio::select! {
                started = &mut start => {
                    return match started {
                        Ok(playback) => Start::Playing { playback, paused },
                        Err(e) => Start::Failed(e),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(QueueCommand::Pause(id)) if id == unit.id => paused = true,
                    Some(QueueCommand::Resume(id)) if id == unit.id => paused = false,
                    Some(QueueCommand::Skip(id)) if id == unit.id => {
                        debug!(unit_id = %unit.id, "Audio unit skipped while starting");
                        return Start::Cancelled(PlaybackOutcome::Skipped, Flow::Continue);
                    }
                    Some(QueueCommand::Stop(id)) if id == unit.id => {
                        debug!(unit_id = %unit.id, "Audio unit stopped while starting");
                        return Start::Cancelled(PlaybackOutcome::Stopped, Flow::Continue);
                    }
                    None | Some(QueueCommand::Shutdown) => {
                        return Start::Cancelled(PlaybackOutcome::Stopped, Flow::Shutdown);
                    }
                    Some(stale) => trace!(?stale, "Stale queue command ignored"),
                },
            }
        }
    }

    /// Waits for the unit to end on its own or be ended by a command.
    async fn supervise(&mut self, unit: &PlaybackUnit, playback: Playback, paused: bool) -> (PlaybackOutcome, Flow) {
        let Playback { mut control, mut done } = playback;
        if paused {
            control.pause();
            debug!(unit_id = %unit.id, "Audio playback paused");
        }

        let result = loop {
            tokio::select! {
                finished = &mut done => {
                    break match finished {
                        Ok(Ok(())) => (PlaybackOutcome::Completed, Flow::Continue),
                        Ok(Err(e)) => (PlaybackOutcome::Failed(e), Flow::Continue),
                        Err(_) => (
                            PlaybackOutcome::Failed(AudioError::Playback("backend dropped the completion".into())),
                            Flow::Continue,
                        ),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(QueueCommand::Pause(id)) if id == unit.id => {
                        control.pause();
                        debug!(unit_id = %unit.id, "Audio playback paused");
                    }
                    Some(QueueCommand::Resume(id)) if id == unit.id => {
                        match control.resume() {
                            Ok(()) => debug!(unit_id = %unit.id, "Audio playback resumed"),
                            Err(e) => {
                                warn!(unit_id = %unit.id, "Failed to resume audio: {}", e);
                                self.emit(QueueEvent::Error { unit_id: Some(id), error: e });
                            }
                        }
                    }
                    Some(QueueCommand::Skip(id)) if id == unit.id => {
                        control.halt();
                        break (PlaybackOutcome::Skipped, Flow::Continue);
                    }
                    Some(QueueCommand::Stop(id)) if id == unit.id => {
                        control.halt();
                        break (PlaybackOutcome::Stopped, Flow::Continue);
                    }
                    None | Some(QueueCommand::Shutdown) => {
                        control.halt();
                        break (PlaybackOutcome::Stopped, Flow::Shutdown);
                    }
                    Some(stale) => trace!(?stale, "Stale queue command ignored"),
                },
            }
        };

        control.release().await;
        result
    }

    fn complete(&self, unit: PlaybackUnit, outcome: PlaybackOutcome) {
        let nothing_pending = {
            let mut queue = self.queue();
            queue.finish(&unit.id);
            queue.is_empty()
        };

        match &outcome {
            PlaybackOutcome::Failed(e) => {
                error!(unit_id = %unit.id, "Error playing audio unit: {}", e);
                self.emit(QueueEvent::Error {
                    unit_id: Some(unit.id.clone()),
                    error: e.clone(),
                });
            }
            other => debug!(unit_id = %unit.id, outcome = ?other, "Audio playback ended"),
        }

        let stopped = outcome == PlaybackOutcome::Stopped;
        self.emit(QueueEvent::PlayEnd { unit, outcome });

        if nothing_pending && !stopped {
            debug!("Audio queue is empty");
            self.emit(QueueEvent::QueueEmpty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_queue::{QueueOptions, SequencedAudioQueue};
    use crate::backend::{MockPlaybackBackend, PlaybackControl};
    use crate::playback_unit::AudioPayload;
    use async_trait::async_trait;

    struct InstantControl;

    #[async_trait]
    impl PlaybackControl for InstantControl {
        fn pause(&mut self) {}
        fn resume(&mut self) -> crate::error::Result<()> {
            Err(AudioError::Output("resume refused".into()))
        }
        fn halt(&mut self) {}
        async fn release(&mut self) {}
    }

    fn finished_playback() -> Playback {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = tx.send(Ok(()));
        Playback::new(Box::new(InstantControl), rx)
    }

    fn unit(id: &str) -> PlaybackUnit {
        PlaybackUnit::with_id(id, AudioPayload::Url(format!("{id}.mp3")))
    }

    #[tokio::test]
    async fn test_failed_start_does_not_halt_queue() {
        let mut backend = MockPlaybackBackend::new();
        backend.expect_start().times(2).returning(|unit| {
            if unit.id == "bad" {
                Err(AudioError::Decode("garbage".into()))
            } else {
                Ok(finished_playback())
            }
        });

        let (queue, mut events) = SequencedAudioQueue::spawn(Arc::new(backend), QueueOptions::default());
        assert!(queue.enqueue(unit("bad")));
        assert!(queue.enqueue(unit("good")));

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = event == QueueEvent::QueueEmpty;
            seen.push(event);
            if done {
                break;
            }
        }

        assert_eq!(seen, vec![
            QueueEvent::PlayStart(unit("bad")),
            QueueEvent::Error { unit_id: Some("bad".into()), error: AudioError::Decode("garbage".into()) },
            QueueEvent::PlayEnd { unit: unit("bad"), outcome: PlaybackOutcome::Failed(AudioError::Decode("garbage".into())) },
            QueueEvent::PlayStart(unit("good")),
            QueueEvent::PlayEnd { unit: unit("good"), outcome: PlaybackOutcome::Completed },
            QueueEvent::QueueEmpty,
        ]);
    }

    #[tokio::test]
    async fn test_dropped_completion_counts_as_failure() {
        let mut backend = MockPlaybackBackend::new();
        backend.expect_start().times(1).returning(|_| {
            let (_tx, rx) = tokio::sync::oneshot::channel();
            Ok(Playback::new(Box::new(InstantControl), rx))
        });

        let (queue, mut events) = SequencedAudioQueue::spawn(Arc::new(backend), QueueOptions::default());
        queue.enqueue(unit("orphan"));

        loop {
            match events.recv().await {
                Some(QueueEvent::PlayEnd { outcome, .. }) => {
                    assert!(outcome.is_failure());
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }
}

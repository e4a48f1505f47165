//! Stream coordination above the audio queue
//!
//! Every piece of conversation audio enters here as a *stream*: a discrete
//! payload routed through the [`SequencedAudioQueue`], a live PCM stream
//! rendered directly by the backend, or a marker created by
//! [`StreamManager::trigger_speaking_state`] for agent audio rendered
//! elsewhere. The manager tracks every stream until it ends, enforces the
//! concurrency ceiling, times stalled streams out and derives the speaking
//! signal from stream lifecycle alone.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio_queue::{QueueOptions, QueueStatus, SequencedAudioQueue};
use crate::backend::{LiveStream, Playback, PlaybackBackend};
use crate::error::AudioError;
use crate::playback_unit::{AudioPayload, Metadata, PlaybackUnit};
use crate::queue_processor::{PlaybackOutcome, QueueEvent};
use crate::speaking::{SpeakingStateBroadcaster, Subscription};

pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 1;
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_AGENT_PRIORITY: i32 = 10;
pub const DEFAULT_USER_PRIORITY: i32 = 5;
/// Capacity of the manager's internal queue.
pub const DEFAULT_STREAM_QUEUE_SIZE: usize = 10;

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub max_concurrent_streams: usize,
    /// Wall-clock budget of an active stream. Zero disables the timeout.
    pub stream_timeout: Duration,
    pub agent_priority: i32,
    pub user_priority: i32,
    pub queue: QueueOptions,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            agent_priority: DEFAULT_AGENT_PRIORITY,
            user_priority: DEFAULT_USER_PRIORITY,
            queue: QueueOptions {
                max_queue_size: DEFAULT_STREAM_QUEUE_SIZE,
                ..QueueOptions::default()
            },
        }
    }
}

/// Audio handed to [`StreamManager::add_stream`].
#[derive(Debug)]
pub enum StreamSource {
    /// Discrete payload, played through the queue
    Payload(AudioPayload),
    /// Continuous PCM, rendered directly once a concurrency slot is free
    Live(LiveStream),
}

impl From<AudioPayload> for StreamSource {
    fn from(payload: AudioPayload) -> Self {
        StreamSource::Payload(payload)
    }
}

impl From<LiveStream> for StreamSource {
    fn from(stream: LiveStream) -> Self {
        StreamSource::Live(stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Queued,
    Live,
    Marker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Waiting,
    Active,
}

/// Lifecycle notifications for debug panels and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamNotice {
    Started { stream_id: String, agent: bool },
    Ended { stream_id: String, outcome: PlaybackOutcome },
    TimedOut { stream_id: String },
    /// Removed before it ever started (capacity eviction, `clear_queue`)
    Dropped { stream_id: String },
    Error { stream_id: Option<String>, error: AudioError },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub active_streams: usize,
    pub queued_streams: usize,
    pub max_concurrent_streams: usize,
    pub speaking: bool,
    pub queue: QueueStatus,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LiveCommand {
    Pause,
    Resume,
    Stop,
}

#[derive(Debug)]
struct StreamEntry {
    kind: StreamKind,
    phase: StreamPhase,
    agent: bool,
    arrived_at: Instant,
    timer: Option<JoinHandle<()>>,
    /// Control channel of an admitted live stream; dropping it halts the stream
    live: Option<mpsc::UnboundedSender<LiveCommand>>,
}

impl StreamEntry {
    fn new(kind: StreamKind, agent: bool) -> Self {
        Self {
            kind,
            phase: StreamPhase::Waiting,
            agent,
            arrived_at: Instant::now(),
            timer: None,
            live: None,
        }
    }
}

impl Drop for StreamEntry {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug)]
enum Internal {
    LiveEnded { stream_id: String, outcome: PlaybackOutcome },
    TimedOut(String),
    Shutdown,
}

/// Bookkeeping behind the manager's lock.
#[derive(Debug)]
struct CoordinatorState {
    streams: HashMap<String, StreamEntry>,
    waiting_live: VecDeque<(String, LiveStream)>,
    live_active: usize,
    ceiling: usize,
    speaking: bool,
    marker: Option<String>,
}

impl CoordinatorState {
    fn new(ceiling: usize) -> Self {
        Self {
            streams: HashMap::new(),
            waiting_live: VecDeque::new(),
            live_active: 0,
            ceiling: ceiling.max(1),
            speaking: false,
            marker: None,
        }
    }

    /// Recomputes the speaking signal and returns the new value on an edge.
    ///
    /// Speaking turns true when an agent stream is active and stays true
    /// while agent streams are still waiting their turn, so back-to-back
    /// replies do not flicker. Once user audio holds a slot with no agent
    /// stream active, speaking turns false even if agent streams wait.
    fn update_speaking(&mut self) -> Option<bool> {
        let any_in = |agent: bool, phase: StreamPhase| {
            self.streams.values().any(|s| s.agent == agent && s.phase == phase)
        };
        let agent_active = any_in(true, StreamPhase::Active);
        let user_active = any_in(false, StreamPhase::Active);
        let speaking =
            agent_active || (self.speaking && !user_active && any_in(true, StreamPhase::Waiting));

        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }

    /// Forgets a stream, releasing its concurrency slot and timer.
    fn remove(&mut self, id: &str) -> Option<StreamEntry> {
        let entry = self.streams.remove(id)?;
        if entry.kind == StreamKind::Live && entry.phase == StreamPhase::Active {
            self.live_active = self.live_active.saturating_sub(1);
        }
        if self.marker.as_deref() == Some(id) {
            self.marker = None;
        }
        Some(entry)
    }

    fn count(&self, phase: StreamPhase) -> usize {
        self.streams.values().filter(|s| s.phase == phase).count()
    }
}

/// Speaking edges waiting to be published.
#[derive(Debug, Default)]
struct Outbox {
    edges: VecDeque<bool>,
    draining: bool,
}

struct Shared {
    state: Mutex<CoordinatorState>,
    outbox: Mutex<Outbox>,
    queue: SequencedAudioQueue,
    backend: Arc<dyn PlaybackBackend>,
    broadcaster: SpeakingStateBroadcaster,
    notices: broadcast::Sender<StreamNotice>,
    internal: mpsc::UnboundedSender<Internal>,
    options: StreamOptions,
    counter: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, notice: StreamNotice) {
        // No receivers is fine
        let _ = self.notices.send(notice);
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Recomputes the speaking signal and stages an edge for publishing.
    /// Staging happens under the state lock, so edges queue up in the order
    /// they were computed.
    fn stage_speaking(&self, state: &mut CoordinatorState) -> Option<bool> {
        let edge = state.update_speaking();
        if let Some(speaking) = edge {
            self.outbox().edges.push_back(speaking);
        }
        edge
    }

    /// Publishes staged edges in order. Never called with the state lock
    /// held, subscribers may call back into the manager. While another call
    /// is draining, including one further up this stack, staged edges are
    /// left to it.
    fn announce(&self, edge: Option<bool>) {
        if edge.is_none() {
            return;
        }
        {
            let mut outbox = self.outbox();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }

        loop {
            let next = {
                let mut outbox = self.outbox();
                let next = outbox.edges.pop_front();
                if next.is_none() {
                    outbox.draining = false;
                }
                next
            };
            let Some(speaking) = next else {
                break;
            };
            info!(speaking, "Speaking state changed");
            self.broadcaster.publish(speaking);
        }
    }

    fn next_stream_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("stream_{}_{}", n, millis)
    }

    fn arm_timer(&self, id: &str) -> Option<JoinHandle<()>> {
        let timeout = self.options.stream_timeout;
        if timeout.is_zero() {
            return None;
        }
        let internal = self.internal.clone();
        let id = id.to_string();
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal.send(Internal::TimedOut(id));
        }))
    }

    /// Marks a tracked stream active and starts its timeout.
    fn activate(&self, state: &mut CoordinatorState, id: &str) {
        let Some(entry) = state.streams.get_mut(id) else {
            return;
        };
        entry.phase = StreamPhase::Active;
        entry.timer = self.arm_timer(id);

        info!(
            stream_id = %id,
            kind = ?entry.kind,
            agent = entry.agent,
            waited_ms = entry.arrived_at.elapsed().as_millis() as u64,
            "Stream started"
        );
        self.notify(StreamNotice::Started {
            stream_id: id.to_string(),
            agent: entry.agent,
        });
    }

    /// Admits waiting live streams while slots are free, then decides
    /// whether the queue may start new units.
    fn admit_live(&self, state: &mut CoordinatorState) {
        while !state.waiting_live.is_empty() {
            if !self.queue.reserve_slot(state.live_active, state.ceiling) {
                break;
            }
            let Some((id, stream)) = state.waiting_live.pop_front() else {
                break;
            };
            state.live_active += 1;

            let (control_tx, control_rx) = mpsc::unbounded_channel();
            if let Some(entry) = state.streams.get_mut(&id) {
                entry.live = Some(control_tx);
            }
            self.activate(state, &id);
            self.spawn_live(id, stream, control_rx);
        }

        let hold = !state.waiting_live.is_empty() || state.live_active >= state.ceiling;
        self.queue.set_held(hold);
    }

    fn spawn_live(&self, stream_id: String, stream: LiveStream, commands: mpsc::UnboundedReceiver<LiveCommand>) {
        let backend = self.backend.clone();
        let internal = self.internal.clone();
        let notices = self.notices.clone();

        tokio::spawn(async move {
            let outcome = match backend.start_live(stream).await {
                Ok(playback) => supervise_live(&stream_id, playback, commands, &notices).await,
                Err(e) => PlaybackOutcome::Failed(e),
            };
            let _ = internal.send(Internal::LiveEnded { stream_id, outcome });
        });
    }

    fn on_queue_event(&self, event: QueueEvent) {
        let edge = match event {
            QueueEvent::PlayStart(unit) => {
                let mut state = self.state();
                if !state.streams.contains_key(&unit.id) {
                    debug!(stream_id = %unit.id, "Untracked unit started");
                    return;
                }
                self.activate(&mut state, &unit.id);
                self.stage_speaking(&mut state)
            }
            QueueEvent::PlayEnd { unit, outcome } => {
                let mut state = self.state();
                if state.remove(&unit.id).is_some() {
                    info!(stream_id = %unit.id, outcome = ?outcome, "Stream ended");
                    self.notify(StreamNotice::Ended {
                        stream_id: unit.id,
                        outcome,
                    });
                } else {
                    debug!(stream_id = %unit.id, "Late play-end for a forgotten stream ignored");
                }
                // The queue's slot is free either way
                self.admit_live(&mut state);
                self.stage_speaking(&mut state)
            }
            QueueEvent::Evicted(unit) => {
                let mut state = self.state();
                if state.remove(&unit.id).is_some() {
                    self.notify(StreamNotice::Dropped { stream_id: unit.id });
                }
                self.stage_speaking(&mut state)
            }
            QueueEvent::Error { unit_id, error } => {
                self.notify(StreamNotice::Error {
                    stream_id: unit_id,
                    error,
                });
                None
            }
            QueueEvent::QueueEmpty => {
                debug!("Stream queue drained");
                None
            }
        };
        self.announce(edge);
    }

    fn on_live_ended(&self, stream_id: String, outcome: PlaybackOutcome) {
        let edge = {
            let mut state = self.state();
            if state.remove(&stream_id).is_some() {
                if let PlaybackOutcome::Failed(e) = &outcome {
                    error!(stream_id = %stream_id, "Live stream failed: {}", e);
                    self.notify(StreamNotice::Error {
                        stream_id: Some(stream_id.clone()),
                        error: e.clone(),
                    });
                }
                info!(stream_id = %stream_id, outcome = ?outcome, "Stream ended");
                self.notify(StreamNotice::Ended { stream_id, outcome });
            } else {
                debug!(stream_id = %stream_id, "Late end of a forgotten live stream ignored");
            }
            self.admit_live(&mut state);
            self.stage_speaking(&mut state)
        };
        self.announce(edge);
    }

    fn on_timeout(&self, stream_id: String) {
        let edge = {
            let mut state = self.state();
            let Some(entry) = state.remove(&stream_id) else {
                return;
            };
            let timeout = self.options.stream_timeout;
            warn!(stream_id = %stream_id, kind = ?entry.kind, ?timeout, "Stream timed out, evicting");

            match entry.kind {
                StreamKind::Queued => {
                    self.queue.skip_unit(&stream_id);
                }
                StreamKind::Live => {
                    if let Some(live) = &entry.live {
                        let _ = live.send(LiveCommand::Stop);
                    }
                }
                StreamKind::Marker => {}
            }

            self.notify(StreamNotice::Error {
                stream_id: Some(stream_id.clone()),
                error: AudioError::Timeout(timeout.as_millis() as u64),
            });
            self.notify(StreamNotice::TimedOut { stream_id });
            self.admit_live(&mut state);
            self.stage_speaking(&mut state)
        };
        self.announce(edge);
    }
}

/// Drives one admitted live stream until it ends or is halted.
async fn supervise_live(
    stream_id: &str,
    playback: Playback,
    mut commands: mpsc::UnboundedReceiver<LiveCommand>,
    notices: &broadcast::Sender<StreamNotice>,
) -> PlaybackOutcome {
    let Playback { mut control, mut done } = playback;

    let outcome = loop {
        tokio::select! {
            finished = &mut done => {
                break match finished {
                    Ok(Ok(())) => PlaybackOutcome::Completed,
                    Ok(Err(e)) => PlaybackOutcome::Failed(e),
                    Err(_) => PlaybackOutcome::Failed(AudioError::Playback("backend dropped the completion".into())),
                };
            }
            command = commands.recv() => match command {
                Some(LiveCommand::Pause) => control.pause(),
                Some(LiveCommand::Resume) => {
                    if let Err(e) = control.resume() {
                        warn!(stream_id = %stream_id, "Failed to resume live stream: {}", e);
                        let _ = notices.send(StreamNotice::Error {
                            stream_id: Some(stream_id.to_string()),
                            error: e,
                        });
                    }
                }
                Some(LiveCommand::Stop) | None => {
                    control.halt();
                    break PlaybackOutcome::Stopped;
                }
            },
        }
    };

    control.release().await;
    outcome
}

async fn run_events(
    shared: Arc<Shared>,
    mut queue_events: mpsc::UnboundedReceiver<QueueEvent>,
    mut internal: mpsc::UnboundedReceiver<Internal>,
) {
    loop {
        tokio::select! {
            event = queue_events.recv() => match event {
                Some(event) => shared.on_queue_event(event),
                None => break,
            },
            message = internal.recv() => match message {
                Some(Internal::LiveEnded { stream_id, outcome }) => shared.on_live_ended(stream_id, outcome),
                Some(Internal::TimedOut(stream_id)) => shared.on_timeout(stream_id),
                Some(Internal::Shutdown) | None => break,
            },
        }
    }
    debug!("Stream manager event loop stopped");
}

/// Coordinates conversation audio streams on top of a [`SequencedAudioQueue`].
pub struct StreamManager {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamManager {
    /// Spawns the internal queue and event loop. Must be called inside a
    /// Tokio runtime.
    pub fn new(backend: Arc<dyn PlaybackBackend>, options: StreamOptions) -> Self {
        Self::with_broadcaster(backend, options, SpeakingStateBroadcaster::new())
    }

    /// Same as [`new`](Self::new), publishing speaking edges on an existing
    /// broadcaster.
    pub fn with_broadcaster(
        backend: Arc<dyn PlaybackBackend>,
        options: StreamOptions,
        broadcaster: SpeakingStateBroadcaster,
    ) -> Self {
        let (queue, queue_events) = SequencedAudioQueue::spawn(backend.clone(), options.queue.clone());
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let shared = Arc::new(Shared {
            state: Mutex::new(CoordinatorState::new(options.max_concurrent_streams)),
            outbox: Mutex::new(Outbox::default()),
            queue,
            backend,
            broadcaster,
            notices,
            internal: internal_tx,
            options,
            counter: AtomicU64::new(0),
        });
        let task = tokio::spawn(run_events(shared.clone(), queue_events, internal_rx));

        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Tracks a new stream and schedules it. Returns the stream id
    /// immediately.
    ///
    /// Agent audio (`isAgentResponse` in `metadata`) outranks user audio in
    /// the queue.
    pub fn add_stream(&self, source: impl Into<StreamSource>, metadata: Metadata) -> String {
        let shared = &self.shared;
        let stream_id = shared.next_stream_id();
        let agent = metadata.is_agent_response();

        match source.into() {
            StreamSource::Payload(payload) => {
                let priority = if agent {
                    shared.options.agent_priority
                } else {
                    shared.options.user_priority
                };
                info!(stream_id = %stream_id, agent, priority, payload = payload.kind(), "Stream added");

                shared
                    .state()
                    .streams
                    .insert(stream_id.clone(), StreamEntry::new(StreamKind::Queued, agent));

                let unit = PlaybackUnit::with_id(stream_id.clone(), payload)
                    .priority(priority)
                    .metadata(metadata);
                if !shared.queue.enqueue(unit) {
                    let edge = {
                        let mut state = shared.state();
                        state.remove(&stream_id);
                        shared.stage_speaking(&mut state)
                    };
                    shared.notify(StreamNotice::Error {
                        stream_id: Some(stream_id.clone()),
                        error: AudioError::Shutdown,
                    });
                    shared.announce(edge);
                }
            }
            StreamSource::Live(stream) => {
                info!(
                    stream_id = %stream_id,
                    agent,
                    sample_rate = stream.sample_rate,
                    channels = stream.channels,
                    "Live stream added"
                );
                let edge = {
                    let mut state = shared.state();
                    state
                        .streams
                        .insert(stream_id.clone(), StreamEntry::new(StreamKind::Live, agent));
                    state.waiting_live.push_back((stream_id.clone(), stream));
                    shared.admit_live(&mut state);
                    shared.stage_speaking(&mut state)
                };
                shared.announce(edge);
            }
        }

        stream_id
    }

    /// Reports agent audio rendered outside this manager (e.g. by the RTC
    /// layer). `true` opens a marker stream, `false` ends it. Markers take
    /// part in the speaking signal and time out like any stream but do not
    /// occupy a concurrency slot.
    pub fn trigger_speaking_state(&self, speaking: bool) {
        let shared = &self.shared;
        let edge = {
            let mut state = shared.state();
            if speaking {
                if state.marker.is_none() {
                    let id = shared.next_stream_id();
                    state.streams.insert(id.clone(), StreamEntry::new(StreamKind::Marker, true));
                    shared.activate(&mut state, &id);
                    state.marker = Some(id);
                }
            } else if let Some(id) = state.marker.clone() {
                state.remove(&id);
                shared.notify(StreamNotice::Ended {
                    stream_id: id,
                    outcome: PlaybackOutcome::Completed,
                });
            }
            shared.stage_speaking(&mut state)
        };
        shared.announce(edge);
    }

    /// Halts everything and forgets every stream.
    pub fn stop_all_streams(&self) {
        let shared = &self.shared;
        shared.queue.stop();

        let (edge, stopped) = {
            let mut state = shared.state();
            let ids: Vec<String> = state.streams.keys().cloned().collect();
            for id in &ids {
                if let Some(entry) = state.remove(id) {
                    if let Some(live) = &entry.live {
                        let _ = live.send(LiveCommand::Stop);
                    }
                }
            }
            state.waiting_live.clear();
            shared.queue.set_held(false);
            (shared.stage_speaking(&mut state), ids)
        };

        if !stopped.is_empty() {
            info!(count = stopped.len(), "All streams stopped");
        }
        for stream_id in stopped {
            shared.notify(StreamNotice::Ended {
                stream_id,
                outcome: PlaybackOutcome::Stopped,
            });
        }
        shared.announce(edge);
    }

    pub fn pause_all_streams(&self) {
        self.shared.queue.pause();
        self.send_live(LiveCommand::Pause);
    }

    pub fn resume_all_streams(&self) {
        self.shared.queue.resume();
        self.send_live(LiveCommand::Resume);
    }

    /// Skips the unit the queue is playing. Bookkeeping follows from its
    /// play-end.
    pub fn skip_current_stream(&self) {
        self.shared.queue.skip();
    }

    fn send_live(&self, command: LiveCommand) {
        let state = self.shared.state();
        for entry in state.streams.values() {
            if let Some(live) = &entry.live {
                let _ = live.send(command);
            }
        }
    }

    /// Drops every stream that has not started yet. Returns how many.
    pub fn clear_queue(&self) -> usize {
        let shared = &self.shared;
        let units = shared.queue.clear_queue();

        let (edge, dropped) = {
            let mut state = shared.state();
            let mut dropped: Vec<String> = units.into_iter().map(|u| u.id).collect();
            dropped.extend(state.waiting_live.drain(..).map(|(id, _)| id));
            dropped.retain(|id| state.remove(id).is_some());
            shared.admit_live(&mut state);
            (shared.stage_speaking(&mut state), dropped)
        };

        let count = dropped.len();
        debug!(count, "Waiting streams cleared");
        for stream_id in dropped {
            shared.notify(StreamNotice::Dropped { stream_id });
        }
        shared.announce(edge);
        count
    }

    pub fn set_max_concurrent_streams(&self, max: usize) {
        let shared = &self.shared;
        let edge = {
            let mut state = shared.state();
            state.ceiling = max.max(1);
            shared.admit_live(&mut state);
            shared.stage_speaking(&mut state)
        };
        debug!(max_concurrent_streams = max.max(1), "Concurrency ceiling updated");
        shared.announce(edge);
    }

    /// Whether agent audio owned by this manager is being rendered right now.
    pub fn is_playing_agent_response(&self) -> bool {
        self.shared
            .state()
            .streams
            .values()
            .any(|s| s.agent && s.phase == StreamPhase::Active && s.kind != StreamKind::Marker)
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.state().speaking
    }

    pub fn status(&self) -> StreamStatus {
        let (active_streams, queued_streams, max_concurrent_streams, speaking) = {
            let state = self.shared.state();
            (
                state.count(StreamPhase::Active),
                state.count(StreamPhase::Waiting),
                state.ceiling,
                state.speaking,
            )
        };
        StreamStatus {
            active_streams,
            queued_streams,
            max_concurrent_streams,
            speaking,
            queue: self.shared.queue.get_status(),
        }
    }

    pub fn broadcaster(&self) -> &SpeakingStateBroadcaster {
        &self.shared.broadcaster
    }

    /// Shorthand for subscribing to the speaking signal.
    pub fn on_speaking_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.shared.broadcaster.subscribe(callback)
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<StreamNotice> {
        self.shared.notices.subscribe()
    }

    /// Stops every stream, shuts the event loop and the queue down and
    /// releases the output.
    pub async fn destroy(&self) {
        self.stop_all_streams();
        let _ = self.shared.internal.send(Internal::Shutdown);

        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Stream manager event loop ended abnormally: {}", e);
            }
        }
        self.shared.queue.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: StreamKind, agent: bool, phase: StreamPhase) -> StreamEntry {
        let mut entry = StreamEntry::new(kind, agent);
        entry.phase = phase;
        entry
    }

    #[test]
    fn test_speaking_edges() {
        let mut state = CoordinatorState::new(1);
        state.streams.insert("a".into(), entry(StreamKind::Queued, true, StreamPhase::Waiting));
        assert_eq!(state.update_speaking(), None);

        state.streams.insert("a".into(), entry(StreamKind::Queued, true, StreamPhase::Active));
        assert_eq!(state.update_speaking(), Some(true));
        assert_eq!(state.update_speaking(), None);

        state.remove("a");
        assert_eq!(state.update_speaking(), Some(false));
    }

    #[test]
    fn test_waiting_agent_stream_keeps_speaking() {
        let mut state = CoordinatorState::new(1);
        state.streams.insert("a".into(), entry(StreamKind::Queued, true, StreamPhase::Active));
        state.streams.insert("b".into(), entry(StreamKind::Queued, true, StreamPhase::Waiting));
        assert_eq!(state.update_speaking(), Some(true));

        state.remove("a");
        assert_eq!(state.update_speaking(), None);
        assert!(state.speaking);

        state.remove("b");
        assert_eq!(state.update_speaking(), Some(false));
    }

    #[test]
    fn test_user_audio_in_the_slot_ends_speaking() {
        let mut state = CoordinatorState::new(1);
        state.streams.insert("a".into(), entry(StreamKind::Queued, true, StreamPhase::Active));
        state.streams.insert("b".into(), entry(StreamKind::Queued, true, StreamPhase::Waiting));
        assert_eq!(state.update_speaking(), Some(true));

        // A user live stream takes the freed slot ahead of the waiting reply
        state.remove("a");
        state.streams.insert("u".into(), entry(StreamKind::Live, false, StreamPhase::Active));
        assert_eq!(state.update_speaking(), Some(false));

        state.remove("u");
        state.streams.insert("b".into(), entry(StreamKind::Queued, true, StreamPhase::Active));
        assert_eq!(state.update_speaking(), Some(true));
    }

    #[test]
    fn test_user_streams_never_speak() {
        let mut state = CoordinatorState::new(1);
        state.streams.insert("u".into(), entry(StreamKind::Live, false, StreamPhase::Active));
        assert_eq!(state.update_speaking(), None);
        assert!(!state.speaking);
    }

    #[test]
    fn test_remove_releases_live_slot_once() {
        let mut state = CoordinatorState::new(2);
        state.streams.insert("l".into(), entry(StreamKind::Live, true, StreamPhase::Active));
        state.live_active = 1;

        assert!(state.remove("l").is_some());
        assert!(state.remove("l").is_none());
        assert_eq!(state.live_active, 0);
    }

    #[test]
    fn test_ceiling_is_at_least_one() {
        assert_eq!(CoordinatorState::new(0).ceiling, 1);
    }
}

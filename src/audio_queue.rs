use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::PlaybackBackend;
use crate::playback_unit::PlaybackUnit;
use crate::queue_processor::{QueueEvent, QueueProcessor};

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Pending units kept before the oldest lowest-priority one is dropped.
    /// Zero disables the bound.
    pub max_queue_size: usize,
    /// Pause between one unit's cleanup and the next unit's start.
    pub settle_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            settle_delay: Duration::ZERO,
        }
    }
}

/// Snapshot for debug overlays and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_playing: bool,
    pub current_id: Option<String>,
    pub has_output: bool,
}

/// Commands from the queue handle to its drain task. Unit-scoped commands
/// carry the id of the unit that was current when they were issued, so a
/// command racing a unit change never hits the successor.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueueCommand {
    Wake,
    Pause(String),
    Resume(String),
    Skip(String),
    Stop(String),
    Shutdown,
}

#[derive(Debug)]
struct PendingUnit {
    seq: u64,
    unit: PlaybackUnit,
}

/// Queue state shared between the handle and the drain task.
///
/// `pending` stays sorted by priority (descending), then arrival
/// (ascending). `current` is the single unit being rendered.
#[derive(Debug)]
pub struct AudioQueue {
    pending: VecDeque<PendingUnit>,
    current: Option<PlaybackUnit>,
    max_queue_size: usize,
    next_seq: u64,
    held: bool,
}

impl AudioQueue {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            max_queue_size,
            next_seq: 0,
            held: false,
        }
    }

    /// Inserts `unit` in priority order. When the queue is full the oldest
    /// unit of the lowest priority tier is dropped first and returned.
    pub fn push(&mut self, unit: PlaybackUnit) -> Option<PlaybackUnit> {
        let evicted = if self.max_queue_size > 0 && self.pending.len() >= self.max_queue_size {
            self.evict_one()
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;

        // Later arrivals go behind every unit of equal or higher priority
        let index = self.pending.partition_point(|p| p.unit.priority >= unit.priority);
        self.pending.insert(index, PendingUnit { seq, unit });

        evicted
    }

    fn evict_one(&mut self) -> Option<PlaybackUnit> {
        let lowest = self.pending.back()?.unit.priority;
        let index = self.pending.partition_point(|p| p.unit.priority > lowest);
        self.pending.remove(index).map(|p| p.unit)
    }

    /// Moves the head of `pending` into `current` when idle and not held.
    pub fn begin_next(&mut self) -> Option<PlaybackUnit> {
        if self.current.is_some() || self.held {
            return None;
        }
        let next = self.pending.pop_front()?.unit;
        self.current = Some(next.clone());
        Some(next)
    }

    /// Clears `current` if it is still the unit `id`.
    pub fn finish(&mut self, id: &str) -> bool {
        if self.current.as_ref().is_some_and(|c| c.id == id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    pub fn take_current(&mut self) -> Option<PlaybackUnit> {
        self.current.take()
    }

    pub fn clear_pending(&mut self) -> Vec<PlaybackUnit> {
        self.pending.drain(..).map(|p| p.unit).collect()
    }

    pub fn current(&self) -> Option<&PlaybackUnit> {
        self.current.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PlaybackUnit> {
        self.pending.iter().map(|p| &p.unit)
    }

    /// Arrival sequence of the pending unit `id`.
    pub fn arrival_of(&self, id: &str) -> Option<u64> {
        self.pending.iter().find(|p| p.unit.id == id).map(|p| p.seq)
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// While held, the drain task finishes the current unit but starts no new one.
    pub fn set_held(&mut self, held: bool) {
        self.held = held;
    }

    /// Claims an output slot for audio rendered outside the queue.
    ///
    /// Counts the queue's own slot against `ceiling` and holds the queue when
    /// the claim uses the last slot. Checking and holding happen under the
    /// same lock the drain task takes to start a unit.
    pub fn reserve_slot(&mut self, external_active: usize, ceiling: usize) -> bool {
        let in_use = external_active + usize::from(self.current.is_some());
        if in_use >= ceiling {
            return false;
        }
        if external_active + 1 >= ceiling {
            self.held = true;
        }
        true
    }
}

impl Default for AudioQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE)
    }
}

/// Ordered, priority-aware, single-flight playback queue.
///
/// Cheap to clone; all clones drive the same drain task. Lifecycle
/// notifications arrive on the receiver returned by [`spawn`](Self::spawn).
#[derive(Clone)]
pub struct SequencedAudioQueue {
    state: Arc<Mutex<AudioQueue>>,
    commands: UnboundedSender<QueueCommand>,
    events: UnboundedSender<QueueEvent>,
    backend: Arc<dyn PlaybackBackend>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SequencedAudioQueue {
    /// Starts the drain task. Must be called inside a Tokio runtime.
    pub fn spawn(
        backend: Arc<dyn PlaybackBackend>,
        options: QueueOptions,
    ) -> (Self, UnboundedReceiver<QueueEvent>) {
        let state = Arc::new(Mutex::new(AudioQueue::new(options.max_queue_size)));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let processor = QueueProcessor::new(
            state.clone(),
            backend.clone(),
            command_rx,
            event_tx.clone(),
            options.settle_delay,
        );
        let handle = tokio::spawn(processor.run());

        let queue = Self {
            state,
            commands: command_tx,
            events: event_tx,
            backend,
            task: Arc::new(Mutex::new(Some(handle))),
        };
        (queue, event_rx)
    }

    fn state(&self) -> MutexGuard<'_, AudioQueue> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, command: QueueCommand) {
        if self.commands.send(command).is_err() {
            debug!("Queue drain task is gone, command dropped");
        }
    }

    /// Adds `unit` in priority order and wakes the drain task.
    /// Returns false only once the queue has been destroyed.
    pub fn enqueue(&self, unit: PlaybackUnit) -> bool {
        if self.commands.is_closed() {
            warn!(unit_id = %unit.id, "Enqueue on a destroyed audio queue");
            return false;
        }

        let (evicted, queue_length) = {
            let mut state = self.state();
            let evicted = state.push(unit);
            (evicted, state.len())
        };

        if let Some(evicted) = evicted {
            warn!(unit_id = %evicted.id, "Audio queue is full, dropped oldest lowest-priority unit");
            let _ = self.events.send(QueueEvent::Evicted(evicted));
        }
        debug!(queue_length, "Audio unit added to queue");

        self.send(QueueCommand::Wake);
        true
    }

    fn current_id(&self) -> Option<String> {
        self.state().current().map(|c| c.id.clone())
    }

    /// Suspends the current unit in place. No-op when idle.
    pub fn pause(&self) {
        if let Some(id) = self.current_id() {
            self.send(QueueCommand::Pause(id));
        }
    }

    /// Resumes a paused unit. A refused resume is reported as a
    /// [`QueueEvent::Error`] carrying the unit id.
    pub fn resume(&self) {
        if let Some(id) = self.current_id() {
            self.send(QueueCommand::Resume(id));
        }
    }

    /// Ends the current unit early; it reports a `Skipped` outcome.
    pub fn skip(&self) {
        if let Some(id) = self.current_id() {
            self.send(QueueCommand::Skip(id));
        }
    }

    /// Skips the current unit only if it is still `id`.
    pub fn skip_unit(&self, id: &str) -> bool {
        if self.current_id().as_deref() == Some(id) {
            self.send(QueueCommand::Skip(id.to_string()));
            true
        } else {
            false
        }
    }

    /// Halts the current unit and discards everything pending.
    /// Idle queues are left untouched.
    pub fn stop(&self) {
        let (current, discarded) = {
            let mut state = self.state();
            (state.take_current(), state.clear_pending())
        };
        if current.is_none() && discarded.is_empty() {
            return;
        }
        debug!(discarded = discarded.len(), "Audio queue stopped");
        if let Some(current) = current {
            self.send(QueueCommand::Stop(current.id));
        }
    }

    /// Drops pending units without touching the current one.
    pub fn clear_queue(&self) -> Vec<PlaybackUnit> {
        self.state().clear_pending()
    }

    pub fn get_status(&self) -> QueueStatus {
        let state = self.state();
        QueueStatus {
            queue_length: state.len(),
            is_playing: state.is_playing(),
            current_id: state.current().map(|c| c.id.clone()),
            has_output: self.backend.has_output(),
        }
    }

    /// Ordered copy of the pending units.
    pub fn get_queue(&self) -> Vec<PlaybackUnit> {
        self.state().pending().cloned().collect()
    }

    pub(crate) fn set_held(&self, held: bool) {
        let changed = {
            let mut state = self.state();
            let changed = state.is_held() != held;
            state.set_held(held);
            changed
        };
        if changed && !held {
            self.send(QueueCommand::Wake);
        }
    }

    pub(crate) fn reserve_slot(&self, external_active: usize, ceiling: usize) -> bool {
        self.state().reserve_slot(external_active, ceiling)
    }

    /// Stops playback, shuts the drain task down and closes the output.
    pub async fn destroy(&self) {
        self.stop();
        self.send(QueueCommand::Shutdown);

        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Audio queue drain task ended abnormally: {}", e);
            }
            self.backend.close().await;
        }
    }
}

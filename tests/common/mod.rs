#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use catvoice::{
    AudioError, AudioPayload, LiveStream, Playback, PlaybackBackend, PlaybackControl, PlaybackUnit, QueueEvent,
    Result, StreamManager, StreamNotice,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// What a scripted unit does, selected by its URL:
///
/// - `mock://ok/<ms>` plays for `ms` and completes
/// - `mock://error/<ms>` plays for `ms` and fails
/// - `mock://refuse/<ms>` like `ok`, but every resume is refused
/// - `mock://fail` fails to start
/// - `mock://hang` never completes
/// - `mock://stall` never finishes starting
#[derive(Debug, Clone, Copy, PartialEq)]
enum Script {
    Ok(u64),
    Error(u64),
    Refuse(u64),
    Fail,
    Hang,
    Stall,
}

fn script_of(unit: &PlaybackUnit) -> Script {
    let AudioPayload::Url(url) = &unit.payload else {
        return Script::Ok(10);
    };
    let rest = url.strip_prefix("mock://").unwrap_or(url);
    let (verb, arg) = rest.split_once('/').unwrap_or((rest, "10"));
    let ms = arg.parse().unwrap_or(10);
    match verb {
        "ok" => Script::Ok(ms),
        "error" => Script::Error(ms),
        "refuse" => Script::Refuse(ms),
        "fail" => Script::Fail,
        "hang" => Script::Hang,
        "stall" => Script::Stall,
        other => panic!("unknown script {other}"),
    }
}

#[derive(Debug, Default)]
pub struct Journal {
    pub calls: Vec<String>,
    pub active: usize,
    pub max_active: usize,
}

/// Backend that records every call and plays nothing.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.journal.lock().unwrap().calls.clone()
    }

    pub fn calls_with(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    pub fn active(&self) -> usize {
        self.journal.lock().unwrap().active
    }

    pub fn max_active(&self) -> usize {
        self.journal.lock().unwrap().max_active
    }

    fn record(&self, call: String) {
        self.journal.lock().unwrap().calls.push(call);
    }

    fn begin(&self, id: &str, task: JoinHandle<()>, refuse_resume: bool) -> Box<ScriptedControl> {
        let mut journal = self.journal.lock().unwrap();
        journal.calls.push(format!("start:{id}"));
        journal.active += 1;
        journal.max_active = journal.max_active.max(journal.active);
        Box::new(ScriptedControl {
            id: id.to_string(),
            journal: self.journal.clone(),
            task: Some(task),
            refuse_resume,
            released: false,
        })
    }
}

struct ScriptedControl {
    id: String,
    journal: Arc<Mutex<Journal>>,
    task: Option<JoinHandle<()>>,
    refuse_resume: bool,
    released: bool,
}

impl ScriptedControl {
    fn record(&self, call: &str) {
        self.journal.lock().unwrap().calls.push(format!("{call}:{}", self.id));
    }
}

#[async_trait]
impl PlaybackControl for ScriptedControl {
    fn pause(&mut self) {
        self.record("pause");
    }

    fn resume(&mut self) -> Result<()> {
        self.record("resume");
        if self.refuse_resume {
            return Err(AudioError::Output("autoplay blocked".into()));
        }
        Ok(())
    }

    fn halt(&mut self) {
        self.record("halt");
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.journal.lock().unwrap().active -= 1;
        self.record("release");
    }
}

#[async_trait]
impl PlaybackBackend for ScriptedBackend {
    async fn start(&self, unit: &PlaybackUnit) -> Result<Playback> {
        let script = script_of(unit);
        if script == Script::Fail {
            self.record(format!("fail:{}", unit.id));
            return Err(AudioError::Decode(format!("cannot decode {}", unit.id)));
        }
        if script == Script::Stall {
            self.record(format!("stall:{}", unit.id));
            std::future::pending::<()>().await;
        }

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            match script {
                Script::Ok(ms) | Script::Refuse(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    let _ = tx.send(Ok(()));
                }
                Script::Error(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    let _ = tx.send(Err(AudioError::Playback("stream broke".into())));
                }
                Script::Hang | Script::Fail | Script::Stall => {
                    let _keep = tx;
                    std::future::pending::<()>().await;
                }
            }
        });

        let control = self.begin(&unit.id, task, matches!(script, Script::Refuse(_)));
        Ok(Playback::new(control, rx))
    }

    async fn start_live(&self, mut stream: LiveStream) -> Result<Playback> {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            while stream.frames.recv().await.is_some() {}
            let _ = tx.send(Ok(()));
        });
        Ok(Playback::new(self.begin("live", task, false), rx))
    }

    fn has_output(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.record("close".to_string());
    }
}

pub fn scripted(id: &str, script: &str) -> PlaybackUnit {
    PlaybackUnit::with_id(id, AudioPayload::Url(format!("mock://{script}")))
}

pub fn payload(script: &str) -> AudioPayload {
    AudioPayload::Url(format!("mock://{script}"))
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<QueueEvent>) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("timed out waiting for a queue event")
        .expect("queue event channel closed")
}

/// Collects events up to and including the next `QueueEmpty`.
pub async fn until_empty(events: &mut mpsc::UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = event == QueueEvent::QueueEmpty;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub fn started_ids(events: &[QueueEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::PlayStart(unit) => Some(unit.id.clone()),
            _ => None,
        })
        .collect()
}

/// Records every speaking value the manager publishes.
pub fn speaking_log(manager: &StreamManager) -> Arc<Mutex<Vec<bool>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    manager.on_speaking_change(move |speaking| sink.lock().unwrap().push(speaking));
    log
}

pub fn drain_notices(notices: &mut broadcast::Receiver<StreamNotice>) -> Vec<StreamNotice> {
    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        seen.push(notice);
    }
    seen
}

pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

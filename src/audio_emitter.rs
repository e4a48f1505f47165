use std::io::{BufReader, Cursor, Write};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread;

use async_trait::async_trait;
use bytes::Bytes;
use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use tempfile::NamedTempFile;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{LiveStream, Playback, PlaybackBackend, PlaybackControl};
use crate::decode::decode_to_pcm;
use crate::error::{AudioError, Result};
use crate::playback_unit::{AudioBlob, AudioPayload, PlaybackUnit};

/// Upper bound on fetching a remote payload, body included.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type BoxedSource = Box<dyn Source<Item = f32> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The default output device. `OutputStream` is not `Send`, so it lives on
/// a dedicated thread until the device is dropped; only the handle leaves it.
struct OutputDevice {
    handle: OutputStreamHandle,
    shutdown: std_mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OutputDevice {
    fn open() -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("catvoice-output".into())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    // Returns on shutdown or when the device is dropped
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(AudioError::Output(format!(
                        "Failed to create audio output stream: {}",
                        e
                    ))));
                }
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| AudioError::Output("audio output thread exited".into()))??;

        Ok(Self {
            handle,
            shutdown: shutdown_tx,
            thread: Some(thread),
        })
    }
}

impl Drop for OutputDevice {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Playback backend rendering through rodio on the default output device.
///
/// The device is opened lazily on the first unit and shared by every unit
/// after that; the queue guarantees only one unit drives it at a time.
pub struct AudioEmitter {
    device: Mutex<Option<OutputDevice>>,
    volume: Mutex<f32>,
    http: reqwest::Client,
}

impl AudioEmitter {
    pub fn new() -> Self {
        Self {
            device: Mutex::new(None),
            volume: Mutex::new(1.0),
            http: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Opens the output device now instead of on first playback.
    pub async fn open(&self) -> Result<()> {
        self.output_handle().await.map(|_| ())
    }

    /// Volume applied to units started from now on.
    pub fn set_volume(&self, volume: f32) {
        *lock(&self.volume) = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f32 {
        *lock(&self.volume)
    }

    async fn output_handle(&self) -> Result<OutputStreamHandle> {
        if let Some(device) = lock(&self.device).as_ref() {
            return Ok(device.handle.clone());
        }

        let opened = tokio::task::spawn_blocking(OutputDevice::open)
            .await
            .map_err(|e| AudioError::Output(format!("audio output task failed: {}", e)))??;
        info!("Audio output initialized");

        let mut device = lock(&self.device);
        Ok(device.get_or_insert(opened).handle.clone())
    }

    async fn fetch(&self, url: &str) -> Result<Bytes> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self.http.get(url).send().await?.error_for_status()?;
            return Ok(response.bytes().await?);
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| AudioError::Io(format!("Failed to read {}: {}", path, e)))?;
        Ok(Bytes::from(bytes))
    }

    fn new_sink(&self, handle: &OutputStreamHandle) -> Result<Sink> {
        let sink = Sink::try_new(handle)
            .map_err(|e| AudioError::Output(format!("Failed to create audio sink: {}", e)))?;
        sink.set_volume(self.volume());
        Ok(sink)
    }

    fn play_source(
        &self,
        handle: &OutputStreamHandle,
        source: BoxedSource,
        temp_file: Option<NamedTempFile>,
    ) -> Result<Playback> {
        let (done_tx, done_rx) = oneshot::channel();
        let sink = self.new_sink(handle)?;
        sink.append(source);
        sink.append(end_marker(done_tx));

        let control = SinkControl {
            sink: Arc::new(Mutex::new(sink)),
            temp_file,
            task: None,
        };
        Ok(Playback::new(Box::new(control), done_rx))
    }
}

impl Default for AudioEmitter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_temp_file(blob: &AudioBlob) -> Result<NamedTempFile> {
    let suffix = blob.extension().map(|e| format!(".{e}")).unwrap_or_default();
    let mut file = tempfile::Builder::new()
        .prefix("catvoice-")
        .suffix(&suffix)
        .tempfile()?;
    file.write_all(&blob.bytes)?;
    file.flush()?;
    Ok(file)
}

/// Zero-length source that resolves `done` when the sink plays up to it.
fn end_marker(done: oneshot::Sender<Result<()>>) -> EmptyCallback<f32> {
    let done = Mutex::new(Some(done));
    EmptyCallback::new(Box::new(move || {
        if let Some(done) = lock(&done).take() {
            let _ = done.send(Ok(()));
        }
    }))
}

async fn feed_live(
    sink: Arc<Mutex<Sink>>,
    mut stream: LiveStream,
    done: oneshot::Sender<Result<()>>,
) {
    while let Some(frame) = stream.frames.recv().await {
        if frame.is_empty() {
            continue;
        }
        lock(&sink).append(SamplesBuffer::new(stream.channels, stream.sample_rate, frame));
    }
    // Sender side closed, completes once the buffered tail has played
    lock(&sink).append(end_marker(done));
}

struct SinkControl {
    sink: Arc<Mutex<Sink>>,
    /// Backing file of a blob payload, owned by this unit only
    temp_file: Option<NamedTempFile>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl PlaybackControl for SinkControl {
    fn pause(&mut self) {
        lock(&self.sink).pause();
    }

    fn resume(&mut self) -> Result<()> {
        lock(&self.sink).play();
        Ok(())
    }

    fn halt(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        lock(&self.sink).stop();
    }

    async fn release(&mut self) {
        lock(&self.sink).stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(file) = self.temp_file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!("Failed to remove temporary audio file {}: {}", path.display(), e);
            } else {
                debug!("Removed temporary audio file {}", path.display());
            }
        }
    }
}

#[async_trait]
impl PlaybackBackend for AudioEmitter {
    async fn start(&self, unit: &PlaybackUnit) -> Result<Playback> {
        let handle = self.output_handle().await?;

        match &unit.payload {
            AudioPayload::Url(url) => {
                let bytes = self.fetch(url).await?;
                let source = Decoder::new(Cursor::new(bytes))?;
                self.play_source(&handle, Box::new(source.convert_samples::<f32>()), None)
            }
            AudioPayload::Blob(blob) => {
                let file = write_temp_file(blob)?;
                let reader = BufReader::new(file.reopen()?);
                // An early return here drops `file`, which deletes it
                let source = Decoder::new(reader)?;
                self.play_source(&handle, Box::new(source.convert_samples::<f32>()), Some(file))
            }
            AudioPayload::Encoded(bytes) => {
                let bytes = bytes.clone();
                let hint = unit
                    .metadata
                    .get("format")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let audio = tokio::task::spawn_blocking(move || decode_to_pcm(bytes, hint.as_deref()))
                    .await
                    .map_err(|e| AudioError::Decode(format!("decode task failed: {}", e)))??;
                let source = SamplesBuffer::new(audio.channels, audio.sample_rate, audio.samples);
                self.play_source(&handle, Box::new(source), None)
            }
        }
    }

    async fn start_live(&self, stream: LiveStream) -> Result<Playback> {
        if stream.channels == 0 || stream.sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "live stream with {} channels at {} Hz",
                stream.channels, stream.sample_rate
            )));
        }

        let handle = self.output_handle().await?;
        let sink = Arc::new(Mutex::new(self.new_sink(&handle)?));

        let (done_tx, done_rx) = oneshot::channel();
        let feeder = tokio::spawn(feed_live(sink.clone(), stream, done_tx));

        let control = SinkControl {
            sink,
            temp_file: None,
            task: Some(feeder),
        };
        Ok(Playback::new(Box::new(control), done_rx))
    }

    fn has_output(&self) -> bool {
        lock(&self.device).is_some()
    }

    async fn close(&self) {
        let device = lock(&self.device).take();
        if device.is_some() {
            drop(device);
            info!("Audio output closed");
        }
    }
}

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use catvoice::audio_emitter::AudioEmitter;
use catvoice::audio_queue::{QueueOptions, SequencedAudioQueue};
use catvoice::simulated::SimulatedBackend;
use catvoice::{AudioBlob, AudioPayload, PlaybackBackend, PlaybackOutcome, PlaybackUnit, QueueEvent};

fn collect_audio_entries() -> Vec<PathBuf> {
    let test_files = std::env::var("TEST_AUDIO_FILES").unwrap_or_else(|_| "test_data".to_string());

    match std::fs::read_dir(&test_files) {
        Ok(read_dir) => read_dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|s| s.to_str())
                    .map(|s| matches!(s, "mp3" | "wav" | "flac" | "ogg"))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>(),
        Err(_) => Vec::new(),
    }
}

fn audio_tests_enabled() -> bool {
    matches!(std::env::var("RUN_AUDIO_TESTS").as_deref(), Ok("1") | Ok("true") | Ok("TRUE"))
}

/// 16-bit mono PCM WAV holding a quiet tone.
fn tone_wav(sample_rate: u32, millis: u32) -> Vec<u8> {
    let frames = sample_rate * millis / 1000;
    let data_len = frames * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 2000.0) as i16;
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

async fn drain(backend: Arc<dyn PlaybackBackend>, units: Vec<PlaybackUnit>) -> Vec<(String, PlaybackOutcome)> {
    let (queue, mut events) = SequencedAudioQueue::spawn(backend, QueueOptions::default());
    for unit in units {
        queue.enqueue(unit);
    }

    let mut ends = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            QueueEvent::PlayEnd { unit, outcome } => ends.push((unit.id, outcome)),
            QueueEvent::QueueEmpty => break,
            _ => {}
        }
    }
    queue.destroy().await;
    ends
}

#[tokio::test(start_paused = true)]
async fn test_simulated_backend_keeps_file_timing() -> Result<()> {
    let mut file = tempfile::Builder::new().suffix(".wav").tempfile()?;
    file.write_all(&tone_wav(8_000, 750))?;
    let path = file.path().to_string_lossy().to_string();

    let started = tokio::time::Instant::now();
    let ends = drain(
        Arc::new(SimulatedBackend::default()),
        vec![
            PlaybackUnit::with_id("file", AudioPayload::Url(path.clone())),
            PlaybackUnit::with_id("blob", AudioPayload::Blob(AudioBlob::new(tone_wav(8_000, 250), Some("audio/wav")))),
            PlaybackUnit::with_id("encoded", AudioPayload::Encoded(tone_wav(8_000, 500).into())),
        ],
    )
    .await;

    assert_eq!(
        ends,
        vec![
            ("file".to_string(), PlaybackOutcome::Completed),
            ("blob".to_string(), PlaybackOutcome::Completed),
            ("encoded".to_string(), PlaybackOutcome::Completed),
        ]
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1_500) && elapsed < Duration::from_millis(1_600));
    Ok(())
}

#[tokio::test]
async fn test_simulated_backend_reports_bad_payloads() -> Result<()> {
    let ends = drain(
        Arc::new(SimulatedBackend::new(Duration::from_millis(10))),
        vec![
            PlaybackUnit::with_id("missing", AudioPayload::Url("/no/such/reply.mp3".into())),
            PlaybackUnit::with_id("garbage", AudioPayload::Encoded(vec![7u8; 64].into())),
        ],
    )
    .await;

    assert_eq!(ends.len(), 2);
    assert!(ends.iter().all(|(_, outcome)| outcome.is_failure()));
    Ok(())
}

#[tokio::test]
async fn test_emitter_plays_generated_blob() -> Result<()> {
    if !audio_tests_enabled() {
        println!("Skipping: set RUN_AUDIO_TESTS=1 to enable");
        return Ok(());
    }

    let emitter = Arc::new(AudioEmitter::new());
    if emitter.open().await.is_err() {
        println!("Skipping: no audio device available");
        return Ok(());
    }

    let ends = drain(
        emitter.clone(),
        vec![
            PlaybackUnit::with_id("blob", AudioPayload::Blob(AudioBlob::new(tone_wav(22_050, 300), Some("audio/wav")))),
            PlaybackUnit::with_id("encoded", AudioPayload::Encoded(tone_wav(22_050, 300).into())),
        ],
    )
    .await;

    assert_eq!(ends.len(), 2);
    assert!(ends.iter().all(|(_, outcome)| *outcome == PlaybackOutcome::Completed));
    assert!(!emitter.has_output());
    Ok(())
}

#[tokio::test]
async fn test_emitter_plays_test_files_in_order() -> Result<()> {
    if !audio_tests_enabled() {
        println!("Skipping: set RUN_AUDIO_TESTS=1 to enable");
        return Ok(());
    }
    let mut entries = collect_audio_entries();
    entries.sort();
    entries.truncate(2);

    if entries.is_empty() {
        println!("No test audio files found, skipping test");
        return Ok(());
    }

    let units = entries
        .iter()
        .map(|p| PlaybackUnit::new(AudioPayload::Url(p.to_string_lossy().to_string())))
        .collect::<Vec<_>>();
    let expected: Vec<String> = units.iter().map(|u| u.id.clone()).collect();

    let ends = drain(Arc::new(AudioEmitter::new()), units).await;

    assert_eq!(ends.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>(), expected);
    Ok(())
}

#[tokio::test]
async fn test_emitter_skip_and_volume() -> Result<()> {
    if !audio_tests_enabled() {
        println!("Skipping: set RUN_AUDIO_TESTS=1 to enable");
        return Ok(());
    }

    let emitter = Arc::new(AudioEmitter::new());
    emitter.set_volume(0.3);
    let (queue, mut events) = SequencedAudioQueue::spawn(emitter, QueueOptions::default());
    queue.enqueue(PlaybackUnit::with_id(
        "long",
        AudioPayload::Encoded(tone_wav(22_050, 5_000).into()),
    ));

    while let Some(event) = events.recv().await {
        match event {
            QueueEvent::PlayStart(_) => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                queue.skip();
            }
            QueueEvent::PlayEnd { outcome, .. } => {
                assert_eq!(outcome, PlaybackOutcome::Skipped);
                break;
            }
            _ => {}
        }
    }
    queue.destroy().await;
    Ok(())
}

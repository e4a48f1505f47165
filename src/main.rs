use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use catvoice::config::DEFAULT_CONFIG_FILE;
use catvoice::decode::{extension_hint, validate_payload};
use catvoice::turn_state::{parse_message, Frame, TurnMessage};
use catvoice::{
    AudioEmitter, AudioPayload, LiveStream, Metadata, PlaybackBackend, PlaybackOutcome, PlaybackUnit,
    QueueEvent, SequencedAudioQueue, Settings, SimulatedBackend, StreamManager, StreamNotice,
};

#[derive(Parser)]
#[command(name = "catvoice")]
#[command(about = "Sequenced voice playback for companion chat")]
#[command(version)]
struct Cli {
    /// Settings file
    #[arg(short, long, env = "CATVOICE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Keep timing but render nothing (no audio device needed)
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play files or URLs in priority order and exit when done
    Play {
        /// Local paths, file:// or http(s):// URLs
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Mark the audio as the agent's voice
        #[arg(long)]
        agent: bool,
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// Volume (0.0 to 1.0)
        #[arg(long, default_value_t = 1.0)]
        volume: f32,
    },
    /// Drive a stream manager from the prompt
    Interactive,
    /// Decode a capture of concatenated TLV room messages
    Frames {
        file: PathBuf,
    },
    /// Write the effective settings to the config file
    InitConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("catvoice=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn make_backend(dry_run: bool, volume: f32) -> Arc<dyn PlaybackBackend> {
    if dry_run {
        Arc::new(SimulatedBackend::default())
    } else {
        let emitter = AudioEmitter::new();
        emitter.set_volume(volume);
        Arc::new(emitter)
    }
}

fn is_remote(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Rejects local files symphonia cannot read before they reach the queue.
async fn check_input(input: &str) -> Result<()> {
    if is_remote(input) {
        return Ok(());
    }
    let path = input.strip_prefix("file://").unwrap_or(input);
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path))?;
    if !validate_payload(bytes.into(), extension_hint(path)) {
        bail!("File is not a valid audio file: {}", path);
    }
    Ok(())
}

/// Inputs that passed [`check_input`], in their original order.
async fn playable_inputs(inputs: Vec<String>) -> Vec<String> {
    let mut playable = Vec::with_capacity(inputs.len());
    for input in inputs {
        match check_input(&input).await {
            Ok(()) => playable.push(input),
            Err(e) => eprintln!("{} {:#}", "Skipping:".yellow(), e),
        }
    }
    playable
}

async fn handle_play(settings: &Settings, dry_run: bool, inputs: Vec<String>, agent: bool, priority: i32, volume: f32) -> Result<()> {
    let backend = make_backend(dry_run, volume);
    let (queue, mut events) = SequencedAudioQueue::spawn(backend, settings.queue_options());

    let playable = playable_inputs(inputs).await;
    if playable.is_empty() {
        bail!("Nothing to play");
    }

    // Every input is checked before the first unit can start
    for input in playable {
        let metadata = if agent { Metadata::agent() } else { Metadata::new() };
        let unit = PlaybackUnit::new(AudioPayload::Url(input.clone()))
            .priority(priority)
            .metadata(metadata.with("source", input));
        queue.enqueue(unit);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(QueueEvent::PlayStart(unit)) => println!("{} {}", "▶".green(), source_of(&unit)),
                Some(QueueEvent::PlayEnd { unit, outcome }) => print_outcome(&source_of(&unit), &outcome),
                Some(QueueEvent::Evicted(unit)) => println!("{} {}", "dropped".yellow(), source_of(&unit)),
                Some(QueueEvent::Error { .. }) => {}
                Some(QueueEvent::QueueEmpty) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping playback...");
                break;
            }
        }
    }

    queue.destroy().await;
    Ok(())
}

fn source_of(unit: &PlaybackUnit) -> String {
    unit.metadata
        .get("source")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| unit.to_string())
}

fn print_outcome(label: &str, outcome: &PlaybackOutcome) {
    match outcome {
        PlaybackOutcome::Completed => println!("{} {}", "✓".green(), label),
        PlaybackOutcome::Skipped => println!("{} {}", "skipped".yellow(), label),
        PlaybackOutcome::Stopped => println!("{} {}", "stopped".yellow(), label),
        PlaybackOutcome::Failed(e) => println!("{} {}: {}", "failed".red(), label, e),
    }
}

/// Feeds a sine tone into a live stream for `seconds`.
fn tone_stream(seconds: f32) -> LiveStream {
    const RATE: u32 = 24_000;
    const CHUNK: usize = 480;
    let (tx, stream) = LiveStream::channel(RATE, 1, 8);
    let total = (seconds.max(0.0) * RATE as f32) as usize;

    tokio::spawn(async move {
        let step = 2.0 * std::f32::consts::PI * 440.0 / RATE as f32;
        let mut n = 0usize;
        while n < total {
            let frame: Vec<f32> = (n..(n + CHUNK).min(total)).map(|i| (i as f32 * step).sin() * 0.2).collect();
            n += frame.len();
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    });
    stream
}

const INTERACTIVE_HELP: &str = "Available commands: add <file>, agent <file>, tone <secs>, speak on|off, pause, resume, skip, stop, clear, ceiling <n>, status, quit";

async fn handle_interactive(settings: &Settings, dry_run: bool) -> Result<()> {
    let backend = make_backend(dry_run, 1.0);
    let manager = StreamManager::new(backend, settings.stream_options());

    let speaking = manager.on_speaking_change(|speaking| {
        let label = if speaking { "speaking".magenta() } else { "idle".blue() };
        println!("\n{} {}", "●".bold(), label);
    });

    let mut notices = manager.subscribe_notices();
    let notice_task = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(StreamNotice::Started { stream_id, agent }) => {
                    println!("\n{} {}{}", "▶".green(), stream_id, if agent { " (agent)" } else { "" })
                }
                Ok(StreamNotice::Ended { stream_id, outcome }) => print_outcome(&stream_id, &outcome),
                Ok(StreamNotice::TimedOut { stream_id }) => println!("\n{} {}", "timed out".red(), stream_id),
                Ok(StreamNotice::Dropped { stream_id }) => println!("\n{} {}", "dropped".yellow(), stream_id),
                Ok(StreamNotice::Error { .. }) => {}
                Err(RecvError::Lagged(n)) => eprintln!("({} notices skipped)", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("{}", "🐱 catvoice interactive mode".bold());
    println!("{}", INTERACTIVE_HELP);

    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    let mut line = String::new();

    loop {
        print!("catvoice> ");
        let _ = std::io::stdout().flush();

        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] => {}
            ["quit" | "exit"] => break,
            ["add", file] | ["agent", file] => {
                if let Err(e) = check_input(file).await {
                    eprintln!("{} {:#}", "Error:".red(), e);
                    continue;
                }
                let metadata = if parts[0] == "agent" { Metadata::agent() } else { Metadata::new() };
                let id = manager.add_stream(AudioPayload::Url(file.to_string()), metadata);
                println!("Added {}", id);
            }
            ["tone", secs] => match secs.parse::<f32>() {
                Ok(secs) => {
                    let id = manager.add_stream(tone_stream(secs), Metadata::agent());
                    println!("Added live {}", id);
                }
                Err(_) => eprintln!("Usage: tone <seconds>"),
            },
            ["speak", "on"] => manager.trigger_speaking_state(true),
            ["speak", "off"] => manager.trigger_speaking_state(false),
            ["pause"] => manager.pause_all_streams(),
            ["resume"] => manager.resume_all_streams(),
            ["skip"] => manager.skip_current_stream(),
            ["stop"] => manager.stop_all_streams(),
            ["clear"] => println!("Cleared {} waiting streams", manager.clear_queue()),
            ["ceiling", n] => match n.parse::<usize>() {
                Ok(n) => manager.set_max_concurrent_streams(n),
                Err(_) => eprintln!("Usage: ceiling <n>"),
            },
            ["status"] => {
                let status = manager.status();
                println!("=== Stream Status ===");
                println!("{}", serde_json::to_string_pretty(&status)?);
                println!("Agent audio playing: {}", manager.is_playing_agent_response());
                println!("=====================");
            }
            _ => {
                eprintln!("Unknown command: {}", line.trim());
                println!("{}", INTERACTIVE_HELP);
            }
        }
    }

    speaking.unsubscribe();
    manager.destroy().await;
    notice_task.abort();
    println!("Goodbye!");
    Ok(())
}

fn handle_frames(file: &Path) -> Result<()> {
    let buf = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let mut offset = 0;

    while offset < buf.len() {
        let rest = &buf[offset..];
        let frame = match Frame::decode(rest) {
            Ok(frame) => frame,
            Err(e) => {
                eprintln!("{} at byte {}: {}", "Malformed frame".red(), offset, e);
                break;
            }
        };
        let frame_len = 8 + frame.value.len();

        match parse_message(&rest[..frame_len]) {
            Ok(TurnMessage::Brief { stage, description }) => {
                println!("{} {:?} {}", "[conv]".cyan(), stage, description.unwrap_or_default())
            }
            Ok(TurnMessage::Subtitle(sub)) => println!(
                "{} {}: {}{}",
                "[subv]".cyan(),
                sub.user_id,
                sub.text,
                if sub.definite { "" } else { " …" }
            ),
            Ok(TurnMessage::ToolCall(call)) => println!("{} {} ({})", "[tool]".cyan(), call.name, call.id),
            Ok(TurnMessage::Other(frame)) => println!("[{}] {}", frame.tag_str(), frame.value),
            Err(e) => println!("{} {}", format!("[{}]", frame.tag_str()).red(), e),
        }
        offset += frame_len;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    match cli.command {
        Commands::Play { inputs, agent, priority, volume } => {
            handle_play(&settings, cli.dry_run, inputs, agent, priority, volume).await?;
        }
        Commands::Interactive => {
            handle_interactive(&settings, cli.dry_run).await?;
        }
        Commands::Frames { file } => {
            handle_frames(&file)?;
        }
        Commands::InitConfig => {
            settings.save(&cli.config)?;
            println!("Settings written to {}", cli.config.display());
        }
    }

    Ok(())
}

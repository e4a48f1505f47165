pub mod audio_emitter;
pub mod audio_queue;
pub mod backend;
pub mod config;
pub mod decode;
pub mod error;
pub mod playback_unit;
pub mod queue_processor;
pub mod simulated;
pub mod speaking;
pub mod stream_manager;
pub mod turn_state;

// Re-exportar tipos públicos para uso externo
pub use audio_emitter::AudioEmitter;
pub use audio_queue::{AudioQueue, QueueOptions, QueueStatus, SequencedAudioQueue};
pub use backend::{LiveStream, Playback, PlaybackBackend, PlaybackControl};
pub use config::Settings;
pub use error::{AudioError, Result};
pub use playback_unit::{AudioBlob, AudioPayload, Metadata, PlaybackUnit};
pub use queue_processor::{PlaybackOutcome, QueueEvent};
pub use simulated::SimulatedBackend;
pub use speaking::{SpeakingStateBroadcaster, Subscription};
pub use stream_manager::{StreamManager, StreamNotice, StreamOptions, StreamSource, StreamStatus};
pub use turn_state::{AgentBrief, CaptureEvent, TurnMessage, TurnStateRouter};

// Versión y metadatos del crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

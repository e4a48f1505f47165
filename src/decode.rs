//! Symphonia helpers for encoded payloads

use std::io::{Cursor, ErrorKind};
use std::path::Path;

use bytes::Bytes;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::error::{AudioError, Result};

/// Interleaved PCM ready to be scheduled on an output.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub channels: u16,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f64 {
        if self.channels == 0 || self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.channels as f64 / self.sample_rate as f64
    }
}

fn probe(bytes: Bytes, extension: Option<&str>) -> Result<Box<dyn FormatReader>> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();

    let probed = symphonia::default::get_probe().format(&hint, mss, &fmt_opts, &meta_opts)?;
    Ok(probed.format)
}

/// Decodes a whole encoded buffer up front.
pub fn decode_to_pcm(bytes: Bytes, extension: Option<&str>) -> Result<DecodedAudio> {
    let mut format = probe(bytes, extension)?;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::UnsupportedFormat("no decodable audio track".into()))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    let mut layout = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
                layout.get_or_insert((spec.channels.count() as u16, spec.rate));
            }
            // Corrupt packets are skipped, the rest of the stream may be fine
            Err(SymphoniaError::DecodeError(e)) => warn!("Skipping undecodable packet: {}", e),
            Err(e) => return Err(e.into()),
        }
    }

    let (channels, sample_rate) = layout
        .ok_or_else(|| AudioError::Decode("payload contained no audio frames".into()))?;

    debug!(channels, sample_rate, samples = samples.len(), "Decoded encoded payload");
    Ok(DecodedAudio { channels, sample_rate, samples })
}

/// Duration from the container headers, when it declares one.
pub fn probe_duration(bytes: Bytes, extension: Option<&str>) -> Result<Option<f64>> {
    let format = probe(bytes, extension)?;

    let duration = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .and_then(|t| {
            let frames = t.codec_params.n_frames?;
            let rate = t.codec_params.sample_rate?;
            Some(frames as f64 / rate as f64)
        });
    Ok(duration)
}

/// True when symphonia recognises the bytes as an audio container.
pub fn validate_payload(bytes: Bytes, extension: Option<&str>) -> bool {
    probe(bytes, extension).is_ok()
}

/// Extension of `path` as a decoder hint.
pub fn extension_hint(path: &str) -> Option<&str> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    Path::new(path).extension().and_then(|e| e.to_str())
}

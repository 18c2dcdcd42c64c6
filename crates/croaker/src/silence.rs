//! The silence track streamed whenever nothing is queued.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::frames::{FrameAlignedStream, MpegVersion, StreamProfile};
use crate::transcoder::TrackStream;

/// MPEG-1 Layer III bitrate table (kbit/s), indexed by the header's bitrate field.
const MPEG1_LAYER3_KBPS: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
/// MPEG-1 sample rates, indexed by the header's sample-rate field.
const MPEG1_SAMPLE_RATES: [u32; 3] = [44_100, 48_000, 32_000];

/// Default length of the generated silence loop.
pub const DEFAULT_SILENCE: Duration = Duration::from_secs(1);

/// Shared bytes of a silent MP3 elementary stream.
///
/// Every call to [`SilenceAsset::stream`] starts a fresh cursor, so the asset is
/// always played from the beginning.
#[derive(Clone, Debug)]
pub struct SilenceAsset {
    bytes: Arc<[u8]>,
}

impl SilenceAsset {
    /// Generate `duration` worth of silent frames for `profile`.
    pub fn generate(profile: StreamProfile, duration: Duration) -> Result<Self> {
        let header = frame_header(profile)?;
        let samples = u64::from(MpegVersion::Mpeg1.samples_per_frame());
        let wanted = duration.as_millis() as u64 * u64::from(profile.sample_rate) / 1000;
        let frames = wanted.div_ceil(samples).max(1) as usize;

        let frame_len = profile.frame_len(MpegVersion::Mpeg1, false);
        let mut bytes = Vec::with_capacity(frames * frame_len);
        for _ in 0..frames {
            let start = bytes.len();
            bytes.extend_from_slice(&header);
            bytes.resize(start + frame_len, 0);
        }
        tracing::debug!(frames, bytes = bytes.len(), "generated silence");
        Ok(Self { bytes: bytes.into() })
    }

    /// Load a silence file from disk; it must contain at least one frame for `profile`.
    pub fn load(path: &Path, profile: StreamProfile) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read silence asset {:?}", path))?;
        let asset = Self::from_bytes(bytes);
        let has_frames = FrameAlignedStream::new(Cursor::new(asset.bytes.clone()), profile, 1)
            .next()
            .is_some_and(|chunk| chunk.is_ok());
        if !has_frames {
            return Err(anyhow!("silence asset {:?} contains no MPEG frames", path));
        }
        Ok(asset)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// A frame-aligned stream over the asset, rewound to the start.
    pub fn stream(&self, profile: StreamProfile, chunk_size: usize) -> TrackStream {
        let reader: Box<dyn Read + Send> = Box::new(Cursor::new(self.bytes.clone()));
        FrameAlignedStream::new(reader, profile, chunk_size)
    }
}

/// Header for an unpadded, unprotected, stereo MPEG-1 Layer III frame.
fn frame_header(profile: StreamProfile) -> Result<[u8; 4]> {
    let bitrate_index = MPEG1_LAYER3_KBPS
        .iter()
        .skip(1)
        .position(|kbps| kbps * 1000 == profile.bitrate)
        .map(|i| i as u8 + 1)
        .ok_or_else(|| anyhow!("unsupported MP3 bitrate {} bit/s", profile.bitrate))?;
    let rate_index = MPEG1_SAMPLE_RATES
        .iter()
        .position(|rate| *rate == profile.sample_rate)
        .map(|i| i as u8)
        .ok_or_else(|| anyhow!("unsupported MP3 sample rate {} Hz", profile.sample_rate))?;
    Ok([0xFF, 0xFB, (bitrate_index << 4) | (rate_index << 2), 0x00])
}

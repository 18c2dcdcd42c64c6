//! Frame-aligned chunking of an MPEG audio elementary stream.
//!
//! Listeners behind the relay can only resynchronise on a frame header, so
//! everything handed downstream of [`FrameAlignedStream`] is a run of whole
//! frames. Frame sizes are derived from the fixed [`StreamProfile`] rather than
//! full bitrate/sample-rate lookup tables; the encoder is forced to that profile.

use std::io::{self, BufReader, Read};
use std::iter::FusedIterator;

/// Size of an MPEG audio frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// MPEG audio version as encoded in bits 3-4 of the second header byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
    Reserved,
}

impl MpegVersion {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b11 => MpegVersion::Mpeg1,
            0b10 => MpegVersion::Mpeg2,
            0b00 => MpegVersion::Mpeg25,
            _ => MpegVersion::Reserved,
        }
    }

    /// Samples carried by one Layer III frame of this version.
    pub fn samples_per_frame(self) -> u32 {
        match self {
            MpegVersion::Mpeg1 => 1152,
            _ => 576,
        }
    }
}

/// The fixed output profile every track is transcoded to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamProfile {
    /// Constant bit rate in bits per second.
    pub bitrate: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self {
            bitrate: 192_000,
            sample_rate: 44_100,
        }
    }
}

impl StreamProfile {
    /// Length in bytes of one frame, header included.
    pub fn frame_len(&self, version: MpegVersion, padded: bool) -> usize {
        if self.sample_rate == 0 {
            return FRAME_HEADER_LEN;
        }
        let samples = u64::from(version.samples_per_frame());
        let len = samples * u64::from(self.bitrate) / 8 / u64::from(self.sample_rate);
        let len = len as usize + usize::from(padded);
        len.max(FRAME_HEADER_LEN)
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate / 1000
    }
}

/// The parts of a frame header needed to size the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub padded: bool,
}

impl FrameHeader {
    /// Parse a 4-byte window, returning `None` when it does not start with a frame sync.
    pub fn parse(bytes: &[u8; FRAME_HEADER_LEN]) -> Option<Self> {
        if !is_frame_sync(bytes[0], bytes[1]) {
            return None;
        }
        Some(Self {
            version: MpegVersion::from_bits(bytes[1] >> 3),
            padded: bytes[2] & 0b0000_0010 != 0,
        })
    }
}

/// 11-bit frame sync: first byte all ones, top three bits of the second byte set.
pub fn is_frame_sync(b0: u8, b1: u8) -> bool {
    b0 == 0xFF && b1 & 0xE0 == 0xE0
}

/// Iterator of frame-aligned chunks read from an MP3 elementary stream.
///
/// Frames are buffered until at least `chunk_size` bytes are held, then yielded
/// together. Whatever is buffered at end of stream is yielded once. Bytes that
/// do not belong to a frame are skipped, and a truncated final frame ends the
/// stream quietly. A read error is yielded once and finishes the stream.
pub struct FrameAlignedStream<R> {
    source: BufReader<R>,
    profile: StreamProfile,
    chunk_size: usize,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> FrameAlignedStream<R> {
    pub fn new(source: R, profile: StreamProfile, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            source: BufReader::with_capacity(chunk_size.max(8 * 1024), source),
            profile,
            chunk_size,
            buf: Vec::with_capacity(chunk_size + profile.frame_len(MpegVersion::Mpeg1, true)),
            done: false,
        }
    }

    /// Append the next whole frame to `self.buf`.
    ///
    /// Returns `false` when the source ends before another complete frame.
    fn read_frame(&mut self) -> io::Result<bool> {
        let mut window = [0u8; FRAME_HEADER_LEN];
        let mut filled = read_up_to(&mut self.source, &mut window)?;
        let header = loop {
            if filled < FRAME_HEADER_LEN {
                tracing::debug!("end of source without another frame sync");
                return Ok(false);
            }
            if let Some(header) = FrameHeader::parse(&window) {
                break header;
            }
            window.copy_within(1.., 0);
            filled = FRAME_HEADER_LEN - 1
                + read_up_to(&mut self.source, &mut window[FRAME_HEADER_LEN - 1..])?;
        };

        let frame_len = self.profile.frame_len(header.version, header.padded);
        let start = self.buf.len();
        self.buf.extend_from_slice(&window);
        self.buf.resize(start + frame_len, 0);
        let want = frame_len - FRAME_HEADER_LEN;
        let got = read_up_to(&mut self.source, &mut self.buf[start + FRAME_HEADER_LEN..])?;
        if got < want {
            tracing::debug!(got, want, "end of source inside a frame; dropping it");
            self.buf.truncate(start);
            return Ok(false);
        }
        Ok(true)
    }
}

impl<R: Read> Iterator for FrameAlignedStream<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.read_frame() {
                Ok(true) => {
                    if self.buf.len() >= self.chunk_size {
                        return Some(Ok(std::mem::take(&mut self.buf)));
                    }
                }
                Ok(false) => {
                    self.done = true;
                    if self.buf.is_empty() {
                        return None;
                    }
                    return Some(Ok(std::mem::take(&mut self.buf)));
                }
                Err(e) => {
                    self.done = true;
                    self.buf.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<R: Read> FusedIterator for FrameAlignedStream<R> {}

/// Fill as much of `buf` as the reader allows, stopping only at EOF.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

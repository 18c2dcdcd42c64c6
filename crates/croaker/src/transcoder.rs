//! Per-track encoder subprocess.
//!
//! Every track is piped through ffmpeg so the relay always receives the same
//! MP3 profile, whatever the source format. The child is owned by the stream
//! reading it and is killed and reaped when that stream is dropped.

use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};

use crate::frames::{FrameAlignedStream, StreamProfile};
use crate::playlist::Track;

/// Bytes of encoder stderr kept for error reports.
const STDERR_TAIL: usize = 2 * 1024;

/// Frame-aligned stream over any boxed byte source.
pub type TrackStream = FrameAlignedStream<Box<dyn Read + Send>>;

/// Result of opening a queued track.
pub enum TrackSource {
    Ready(TrackStream),
    NotFound,
    DecodeError(anyhow::Error),
}

/// Opens queued tracks as frame-aligned MP3 streams.
pub trait TrackOpener: Send {
    fn open(&self, track: &Track) -> TrackSource;
}

/// Opens tracks by spawning ffmpeg for each one.
#[derive(Clone, Debug)]
pub struct Transcoder {
    program: PathBuf,
    profile: StreamProfile,
    chunk_size: usize,
}

impl Transcoder {
    pub fn new(program: impl Into<PathBuf>, profile: StreamProfile, chunk_size: usize) -> Self {
        Self {
            program: program.into(),
            profile,
            chunk_size,
        }
    }
}

impl TrackOpener for Transcoder {
    fn open(&self, track: &Track) -> TrackSource {
        if !track.path().is_file() {
            return TrackSource::NotFound;
        }
        match TranscodingProcess::spawn(&self.program, track.path(), self.profile) {
            Ok(process) => {
                let reader: Box<dyn Read + Send> = Box::new(process);
                TrackSource::Ready(FrameAlignedStream::new(reader, self.profile, self.chunk_size))
            }
            Err(e) => TrackSource::DecodeError(e),
        }
    }
}

/// Arguments forcing the fixed output profile: CBR, fixed rate, no ID3/Xing headers.
pub fn encoder_args(input: &Path, profile: StreamProfile) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(input.as_os_str().to_owned());
    args.extend(
        [
            "-vn".to_string(),
            "-map".to_string(),
            "0:a:0".to_string(),
            "-f".to_string(),
            "mp3".to_string(),
            "-write_xing".to_string(),
            "0".to_string(),
            "-id3v2_version".to_string(),
            "0".to_string(),
            "-b:a".to_string(),
            format!("{}k", profile.bitrate_kbps()),
            "-ar".to_string(),
            profile.sample_rate.to_string(),
            "pipe:1".to_string(),
        ]
        .into_iter()
        .map(OsString::from),
    );
    args
}

/// A running encoder whose stdout is read as the track's MP3 stream.
///
/// Reaching the end of stdout collects the exit status; a failed encoder turns
/// into a read error carrying the tail of its stderr, so the caller can log it
/// and fall back to silence.
pub struct TranscodingProcess {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    reaped: bool,
}

impl TranscodingProcess {
    pub fn spawn(program: &Path, input: &Path, profile: StreamProfile) -> Result<Self> {
        let mut command = Command::new(program);
        command.args(encoder_args(input, profile));
        let process = Self::spawn_command(command)
            .with_context(|| format!("spawn encoder {:?} for {:?}", program, input))?;
        tracing::debug!(pid = process.id(), input = %input.display(), "spawned encoder");
        Ok(process)
    }

    /// Spawn `command` with stdin closed and stdout and stderr piped.
    pub(crate) fn spawn_command(mut command: Command) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("encoder stdout was not captured"))?;
        let stderr = match child.stderr.take().map(collect_stderr).transpose() {
            Ok(stderr) => stderr,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e).context("spawn encoder stderr reader");
            }
        };
        Ok(Self {
            child,
            stdout,
            stderr,
            reaped: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    fn reap(&mut self) -> io::Result<ExitStatus> {
        self.reaped = true;
        self.child.wait()
    }
}

impl Read for TranscodingProcess {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.reaped {
            let status = self.reap()?;
            if !status.success() {
                let stderr = self
                    .stderr
                    .take()
                    .and_then(|reader| reader.join().ok())
                    .unwrap_or_default();
                let message = if stderr.is_empty() {
                    format!("encoder exited with {status}")
                } else {
                    format!("encoder exited with {status}: {stderr}")
                };
                return Err(io::Error::other(message));
            }
        }
        Ok(n)
    }
}

impl Drop for TranscodingProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let pid = self.child.id();
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => tracing::debug!(pid, %status, "encoder stopped"),
            Err(e) => tracing::warn!(pid, "failed to reap encoder: {e}"),
        }
    }
}

/// Drain `stderr` on its own thread so the encoder never blocks on a full
/// pipe; the last [`STDERR_TAIL`] bytes are returned once it closes.
fn collect_stderr(mut stderr: ChildStderr) -> io::Result<JoinHandle<String>> {
    thread::Builder::new()
        .name("encoder-stderr".to_string())
        .spawn(move || {
            let mut tail = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match stderr.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        tail.extend_from_slice(&buf[..n]);
                        if tail.len() > STDERR_TAIL {
                            tail.drain(..tail.len() - STDERR_TAIL);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            String::from_utf8_lossy(&tail).trim().to_string()
        })
}

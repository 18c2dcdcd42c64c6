//! Streamer worker.
//!
//! A single dedicated thread pulls tracks from the playback queue and streams
//! them, one frame-aligned chunk at a time, to the relay. When nothing is
//! queued it streams the silence asset instead, so the relay never starves.
//! Interrupt flags are checked before every chunk is sent.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, TryRecvError};

use crate::control::{ControlSignals, Signal};
use crate::frames::StreamProfile;
use crate::playlist::Track;
use crate::relay::RelaySink;
use crate::silence::SilenceAsset;
use crate::transcoder::{TrackOpener, TrackSource, TrackStream};

/// Relay title while the silence asset is playing.
pub const NOTHING_PLAYING: &str = "[NOTHING PLAYING]";

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

const RETRY_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamerState {
    Connecting,
    StreamingTrack,
    StreamingSilence,
}

#[derive(Clone, Copy, Debug)]
pub struct StreamerOptions {
    pub chunk_size: usize,
    pub profile: StreamProfile,
    /// Pause between relay reconnection attempts.
    pub retry_delay: Duration,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            profile: StreamProfile::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// How a single source ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlayOutcome {
    Finished,
    Interrupted(Signal),
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopControl {
    Continue,
    Shutdown,
}

pub struct AudioStreamer<S, O> {
    queue: Receiver<Track>,
    signals: Arc<ControlSignals>,
    sink: S,
    opener: O,
    silence: SilenceAsset,
    options: StreamerOptions,
    state: StreamerState,
    /// Title last pushed to the relay on the current connection.
    relay_title: Option<String>,
}

impl<S: RelaySink, O: TrackOpener> AudioStreamer<S, O> {
    pub fn new(
        queue: Receiver<Track>,
        signals: Arc<ControlSignals>,
        sink: S,
        opener: O,
        silence: SilenceAsset,
        options: StreamerOptions,
    ) -> Self {
        Self {
            queue,
            signals,
            sink,
            opener,
            silence,
            options,
            state: StreamerState::Connecting,
            relay_title: None,
        }
    }

    pub fn state(&self) -> StreamerState {
        self.state
    }

    /// Stream until the playback queue is closed.
    ///
    /// Relay failures close the connection and are retried after the
    /// configured delay; nothing else ends the loop.
    pub fn run(mut self) {
        tracing::info!(
            chunk_size = self.options.chunk_size,
            bitrate_kbps = self.options.profile.bitrate_kbps(),
            "streamer started"
        );
        loop {
            match self.do_one_loop() {
                Ok(LoopControl::Continue) => {}
                Ok(LoopControl::Shutdown) => break,
                Err(e) => {
                    tracing::error!(
                        retry_ms = self.options.retry_delay.as_millis() as u64,
                        "relay error: {e:#}"
                    );
                    self.sink.close();
                    self.state = StreamerState::Connecting;
                    self.wait_out_retry();
                }
            }
        }
        self.sink.close();
        tracing::info!("streamer stopped");
    }

    /// Stream one source: the next queued track, or silence.
    ///
    /// Only relay failures are returned as errors; a track that cannot be
    /// opened or read is logged and replaced by silence.
    pub(crate) fn do_one_loop(&mut self) -> Result<LoopControl> {
        self.ensure_connected()?;

        let Some((stream, title, state)) = self.next_source() else {
            tracing::info!("playback queue closed");
            return Ok(LoopControl::Shutdown);
        };
        self.state = state;
        self.update_title(&title);

        match self.play_from_stream(stream)? {
            PlayOutcome::Finished => tracing::debug!(title = %title, "source finished"),
            PlayOutcome::Interrupted(signal) => {
                tracing::debug!(title = %title, signal = ?signal, "source interrupted")
            }
            PlayOutcome::Failed => {}
        }
        Ok(LoopControl::Continue)
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.sink.is_connected() {
            return Ok(());
        }
        self.state = StreamerState::Connecting;
        self.sink.open().context("open relay connection")?;
        self.relay_title = None;
        Ok(())
    }

    fn update_title(&mut self, title: &str) {
        if self.relay_title.as_deref() == Some(title) {
            return;
        }
        match self.sink.set_metadata(title) {
            Ok(()) => self.relay_title = Some(title.to_string()),
            Err(e) => tracing::warn!(title, "failed to update relay metadata: {e:#}"),
        }
    }

    /// Sleep out the retry delay, still servicing load and stop.
    ///
    /// A skip is left raised; it applies to the first source after reconnecting.
    pub(crate) fn wait_out_retry(&mut self) {
        let deadline = Instant::now() + self.options.retry_delay;
        loop {
            if let Some(signal @ (Signal::Load | Signal::Stop)) = self.signals.pending() {
                self.handle_interrupt(signal);
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(RETRY_POLL.min(deadline - now));
        }
    }

    /// Next stream to play, or `None` once the queue is closed.
    fn next_source(&mut self) -> Option<(TrackStream, String, StreamerState)> {
        match self.queue.try_recv() {
            Ok(track) => match self.opener.open(&track) {
                TrackSource::Ready(stream) => {
                    tracing::info!(track = %track, "streaming track");
                    return Some((stream, track.title(), StreamerState::StreamingTrack));
                }
                TrackSource::NotFound => {
                    tracing::warn!(track = %track, "queued track not found; streaming silence");
                }
                TrackSource::DecodeError(e) => {
                    tracing::error!(track = %track, "cannot open track; streaming silence: {e:#}");
                }
            },
            Err(TryRecvError::Empty) => tracing::debug!("nothing queued; streaming silence"),
            Err(TryRecvError::Disconnected) => return None,
        }
        let stream = self.silence.stream(self.options.profile, self.options.chunk_size);
        Some((stream, NOTHING_PLAYING.to_string(), StreamerState::StreamingSilence))
    }

    fn play_from_stream(&mut self, stream: TrackStream) -> Result<PlayOutcome> {
        for chunk in stream {
            if let Some(signal) = self.signals.pending() {
                self.handle_interrupt(signal);
                return Ok(PlayOutcome::Interrupted(signal));
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!("source read failed; streaming silence: {e}");
                    return Ok(PlayOutcome::Failed);
                }
            };
            self.sink.send(&chunk)?;
            self.sink.sync();
        }
        Ok(PlayOutcome::Finished)
    }

    fn handle_interrupt(&mut self, signal: Signal) {
        match signal {
            Signal::Load => {
                let dropped = self.drain_queue();
                tracing::info!(dropped, "load requested; queue cleared");
                self.signals.clear(Signal::Skip);
                self.signals.clear(Signal::Stop);
                self.signals.clear(Signal::Load);
            }
            Signal::Stop => {
                let dropped = self.drain_queue();
                tracing::info!(dropped, "stop requested; queue cleared");
                self.signals.clear(Signal::Stop);
            }
            Signal::Skip => {
                tracing::info!("skip requested");
                self.signals.clear(Signal::Skip);
            }
        }
    }

    fn drain_queue(&mut self) -> usize {
        self.queue.try_iter().count()
    }
}

/// Run `streamer` on its own named thread.
pub fn spawn_streamer<S, O>(streamer: AudioStreamer<S, O>) -> Result<JoinHandle<()>>
where
    S: RelaySink + 'static,
    O: TrackOpener + 'static,
{
    thread::Builder::new()
        .name("streamer".to_string())
        .spawn(move || streamer.run())
        .context("spawn streamer thread")
}

//! Playback control shared between the command server and the streamer.
//!
//! The controller owns the producer side of the playback queue and raises the
//! interrupt flags the streamer polls at every chunk boundary. It also keeps a
//! consumer handle so a playlist switch the streamer cannot acknowledge in
//! time is completed here instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::playlist::{PlaylistError, PlaylistStore, Track};

/// How long a playlist switch waits for the streamer to acknowledge the load flag.
pub const DEFAULT_HANDOFF_GRACE: Duration = Duration::from_millis(500);

const HANDOFF_POLL: Duration = Duration::from_millis(5);

/// Interrupt requests, in precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// A new playlist replaces whatever is queued.
    Load,
    /// Halt output and empty the queue.
    Stop,
    /// Abandon the current item only.
    Skip,
}

/// The three level-triggered interrupt flags.
///
/// A flag stays raised until the streamer clears it; raising it again before
/// then has no further effect.
#[derive(Debug, Default)]
pub struct ControlSignals {
    load: AtomicBool,
    stop: AtomicBool,
    skip: AtomicBool,
}

impl ControlSignals {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn flag(&self, signal: Signal) -> &AtomicBool {
        match signal {
            Signal::Load => &self.load,
            Signal::Stop => &self.stop,
            Signal::Skip => &self.skip,
        }
    }

    pub fn raise(&self, signal: Signal) {
        self.flag(signal).store(true, Ordering::Release);
    }

    pub fn clear(&self, signal: Signal) {
        self.flag(signal).store(false, Ordering::Release);
    }

    pub fn is_raised(&self, signal: Signal) -> bool {
        self.flag(signal).load(Ordering::Acquire)
    }

    /// Highest-precedence raised flag: load, then stop, then skip.
    pub fn pending(&self) -> Option<Signal> {
        [Signal::Load, Signal::Stop, Signal::Skip]
            .into_iter()
            .find(|signal| self.is_raised(*signal))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Playlist(#[from] PlaylistError),
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Playlist selection and transport control.
pub struct PlaybackController {
    store: Arc<PlaylistStore>,
    queue_tx: Mutex<Option<Sender<Track>>>,
    queue_rx: Receiver<Track>,
    signals: Arc<ControlSignals>,
    active: Mutex<Option<String>>,
    handoff_grace: Duration,
}

impl PlaybackController {
    pub fn new(
        store: Arc<PlaylistStore>,
        queue_tx: Sender<Track>,
        queue_rx: Receiver<Track>,
        signals: Arc<ControlSignals>,
    ) -> Self {
        Self {
            store,
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx,
            signals,
            active: Mutex::new(None),
            handoff_grace: DEFAULT_HANDOFF_GRACE,
        }
    }

    pub fn with_handoff_grace(mut self, grace: Duration) -> Self {
        self.handoff_grace = grace;
        self
    }

    /// Switch to playlist `name`, returning the number of tracks queued.
    ///
    /// When a playlist is already active the streamer is asked to drop it first.
    /// The handoff waits at most the grace period for that acknowledgement; if
    /// none arrives (the streamer is blocked on the relay) the old queue is
    /// drained and the flags cleared here, so the new tracks are never
    /// mistaken for the old ones.
    pub fn load(&self, name: &str) -> Result<usize, ControlError> {
        let playlist = self.store.resolve(name)?;

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let queue_tx = self
            .queue_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ControlError::ShuttingDown)?;

        if let Some(previous) = active.as_deref() {
            tracing::info!(from = previous, to = name, "switching playlist");
            self.signals.raise(Signal::Load);
            if !self.await_load_ack() {
                let dropped = self.queue_rx.try_iter().count();
                self.signals.clear(Signal::Skip);
                self.signals.clear(Signal::Stop);
                self.signals.clear(Signal::Load);
                tracing::warn!(
                    grace_ms = self.handoff_grace.as_millis() as u64,
                    dropped,
                    "streamer did not acknowledge playlist switch; queue cleared by controller"
                );
            }
        }

        for track in playlist.tracks() {
            queue_tx
                .send(track.clone())
                .map_err(|_| ControlError::ShuttingDown)?;
        }
        *active = Some(name.to_string());
        tracing::info!(playlist = name, tracks = playlist.tracks().len(), "playlist loaded");
        Ok(playlist.tracks().len())
    }

    fn await_load_ack(&self) -> bool {
        let deadline = Instant::now() + self.handoff_grace;
        while self.signals.is_raised(Signal::Load) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(HANDOFF_POLL);
        }
        true
    }

    /// Skip to the next queued track.
    pub fn ffwd(&self) {
        tracing::info!("skip requested");
        self.signals.raise(Signal::Skip);
    }

    /// Halt playback and empty the queue.
    pub fn stop(&self) {
        tracing::info!("stop requested");
        self.signals.raise(Signal::Stop);
    }

    /// All playlist names, or the resolved order of one playlist.
    pub fn list(&self, name: Option<&str>) -> Result<String, PlaylistError> {
        match name {
            Some(name) => Ok(self.store.resolve(name)?.to_string()),
            None => Ok(self.store.names()?.join("\n")),
        }
    }

    pub fn active_playlist(&self) -> Option<String> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Close the queue and stop the streamer at its next chunk boundary.
    pub fn shutdown(&self) {
        let sender = self.queue_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if sender.is_some() {
            tracing::info!("closing playback queue");
        }
        drop(sender);
        self.signals.raise(Signal::Stop);
    }
}

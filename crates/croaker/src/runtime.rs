//! Croaker runtime.
//!
//! Wires the playlist store, controller, streamer worker and control server
//! together, and provides the small client used by `croaker send`.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use crossbeam_channel::Receiver;

use crate::config::CroakerConfig;
use crate::control::{ControlSignals, PlaybackController};
use crate::playlist::{PlaylistStore, Track};
use crate::relay::IcecastSink;
use crate::server::ControlServer;
use crate::streamer::{AudioStreamer, spawn_streamer};
use crate::transcoder::Transcoder;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state owned by the entry point and handed out by `Arc`.
pub struct Context {
    pub config: CroakerConfig,
    pub store: Arc<PlaylistStore>,
    pub signals: Arc<ControlSignals>,
    pub controller: Arc<PlaybackController>,
}

impl Context {
    /// Build the context and return the consumer side of the playback queue.
    pub fn new(config: CroakerConfig) -> (Self, Receiver<Track>) {
        let store = Arc::new(PlaylistStore::new(
            config.playlist_root.clone(),
            config.media_globs.clone(),
        ));
        let signals = ControlSignals::shared();
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        let controller = Arc::new(
            PlaybackController::new(store.clone(), queue_tx, queue_rx.clone(), signals.clone())
                .with_handoff_grace(config.handoff_grace),
        );
        let context = Self {
            config,
            store,
            signals,
            controller,
        };
        (context, queue_rx)
    }
}

/// Run the control server and streamer until STFU or Ctrl-C.
pub fn run_server(config: CroakerConfig, install_ctrlc: bool) -> Result<()> {
    let silence = config.silence_asset()?;
    std::fs::create_dir_all(&config.playlist_root)
        .with_context(|| format!("create playlist root {:?}", config.playlist_root))?;

    let (ctx, queue_rx) = Context::new(config);
    let server = ControlServer::bind(ctx.config.bind, ctx.controller.clone())?;
    let shutdown = server.shutdown_handle();
    if install_ctrlc {
        let shutdown = shutdown.clone();
        let _ = ctrlc::set_handler(move || shutdown.trigger());
    }

    let options = ctx.config.streamer;
    let streamer = AudioStreamer::new(
        queue_rx,
        ctx.signals.clone(),
        IcecastSink::new(ctx.config.icecast.clone()),
        Transcoder::new(ctx.config.ffmpeg.clone(), options.profile, options.chunk_size),
        silence,
        options,
    );
    let worker = spawn_streamer(streamer)?;

    tracing::info!(
        playlist_root = %ctx.config.playlist_root.display(),
        relay = %format!("{}:{}{}", ctx.config.icecast.host, ctx.config.icecast.port, ctx.config.icecast.mount),
        "croaker starting"
    );
    match ctx.controller.load(&ctx.config.session_start) {
        Ok(tracks) => tracing::info!(playlist = %ctx.config.session_start, tracks, "session start queued"),
        Err(e) => tracing::warn!(playlist = %ctx.config.session_start, "session start playlist not loaded: {e}"),
    }

    let served = server.serve();
    ctx.controller.shutdown();
    wait_for_worker(worker, SHUTDOWN_GRACE);
    served
}

fn wait_for_worker(worker: JoinHandle<()>, grace: Duration) {
    let deadline = Instant::now() + grace;
    while !worker.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "streamer still running; exiting anyway");
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    if worker.join().is_err() {
        tracing::error!("streamer thread panicked");
    }
}

/// Send `line` to a running server and return its reply.
///
/// The session is closed with `KTHX` and the server's `KBAI` is stripped from
/// the reply. `STFU` closes the connection on its own.
pub fn send_command(host: &str, port: u16, line: &str) -> Result<String> {
    let mut stream =
        TcpStream::connect((host, port)).with_context(|| format!("connect {host}:{port}"))?;
    stream
        .set_read_timeout(Some(CLIENT_TIMEOUT))
        .context("set read timeout")?;

    let line = line.trim();
    let request = if line.to_uppercase().starts_with("STFU") {
        format!("{line}\n")
    } else {
        format!("{line}\nKTHX\n")
    };
    stream
        .write_all(request.as_bytes())
        .context("send command")?;

    let mut reply = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if !reply.is_empty() && e.kind() == ErrorKind::ConnectionReset => break,
            Err(e) => return Err(e).context("read reply"),
        }
    }

    let reply = String::from_utf8_lossy(&reply);
    let reply = reply.strip_suffix("KBAI\n").unwrap_or(&reply);
    Ok(reply.trim_end_matches('\n').to_string())
}

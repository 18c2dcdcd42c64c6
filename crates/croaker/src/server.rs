//! TCP command server.
//!
//! Each connection is served on its own thread and handled one line at a time.
//! Errors on one connection are logged and never reach the others or the
//! streamer.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::control::{ControlError, PlaybackController};
use crate::protocol::{Command, MAX_LINE, ProtocolError, help_text, parse_line};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// What the connection does after a command has been handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// Send the text and keep reading.
    Line(String),
    /// Send the text and close this connection.
    Close(String),
    /// Send the text, close this connection and stop the server.
    Shutdown(String),
}

/// Run `command` against the controller.
pub fn dispatch(command: Command, controller: &PlaybackController) -> Reply {
    match command {
        Command::Play(name) if name.is_empty() => {
            Reply::Line("ERR PLAY requires a playlist name".to_string())
        }
        Command::Play(name) => match controller.load(&name) {
            Ok(_) => Reply::Line("OK".to_string()),
            Err(ControlError::Playlist(e)) => Reply::Line(format!("ERR {e}")),
            Err(e @ ControlError::ShuttingDown) => Reply::Line(format!("ERR {e}")),
        },
        Command::Ffwd => {
            controller.ffwd();
            Reply::Line("OK".to_string())
        }
        Command::List(name) => match controller.list(name.as_deref()) {
            Ok(listing) => Reply::Line(listing),
            Err(e) => Reply::Line(format!("ERR {e}")),
        },
        Command::Help => Reply::Line(help_text()),
        Command::Kthx => Reply::Close("KBAI".to_string()),
        Command::Stop => {
            controller.stop();
            Reply::Line("OK".to_string())
        }
        Command::Stfu => Reply::Shutdown("Shutting down.".to_string()),
    }
}

/// Stops a running [`ControlServer`] from any thread.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    /// Flag the shutdown and wake the accept loop with a loopback connection.
    pub fn trigger(&self) {
        if self.requested.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("control server shutdown requested");
        if let Err(e) = TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT) {
            tracing::warn!(addr = %self.wake_addr, "failed to wake control server: {e}");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Listener for the control protocol.
pub struct ControlServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    controller: Arc<PlaybackController>,
    shutdown: ShutdownHandle,
}

impl ControlServer {
    pub fn bind(addr: SocketAddr, controller: Arc<PlaybackController>) -> Result<Self> {
        let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
        let local_addr = listener.local_addr().context("read listener address")?;
        let shutdown = ShutdownHandle {
            requested: Arc::new(AtomicBool::new(false)),
            wake_addr: wake_addr(local_addr),
        };
        Ok(Self {
            listener,
            local_addr,
            controller,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is requested.
    pub fn serve(self) -> Result<()> {
        tracing::info!(bind = %self.local_addr, "control server listening");
        for stream in self.listener.incoming() {
            if self.shutdown.is_requested() {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                    continue;
                }
            };
            let controller = self.controller.clone();
            let shutdown = self.shutdown.clone();
            let spawned = thread::Builder::new()
                .name("control-conn".to_string())
                .spawn(move || {
                    if let Err(e) = handle_connection(stream, &controller, &shutdown) {
                        tracing::warn!("connection error: {e:#}");
                    }
                });
            if let Err(e) = spawned {
                tracing::error!("failed to spawn connection thread: {e}");
            }
        }
        tracing::info!("control server stopped");
        Ok(())
    }
}

/// Loopback equivalent of a listener bound to the unspecified address.
fn wake_addr(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

fn handle_connection(
    stream: TcpStream,
    controller: &PlaybackController,
    shutdown: &ShutdownHandle,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    tracing::debug!(peer = ?peer, "client connected");
    let mut writer = stream.try_clone().context("clone connection")?;
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = (&mut reader)
            .take(MAX_LINE as u64 + 1)
            .read_until(b'\n', &mut line)
            .context("read command")?;
        if n == 0 {
            tracing::debug!(peer = ?peer, "client disconnected");
            return Ok(());
        }
        if line.len() > MAX_LINE && !line.ends_with(b"\n") {
            tracing::warn!(peer = ?peer, max = MAX_LINE, "request line too long; closing");
            send_reply(&mut writer, &ProtocolError::LineTooLong(MAX_LINE).to_string())?;
            let _ = writer.shutdown(Shutdown::Both);
            return Ok(());
        }
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(peer = ?peer, "rejected command: {e}");
                send_reply(&mut writer, &e.to_string())?;
                continue;
            }
        };
        tracing::debug!(peer = ?peer, command = ?command, "received command");

        match dispatch(command, controller) {
            Reply::Line(text) => send_reply(&mut writer, &text)?,
            Reply::Close(text) => {
                send_reply(&mut writer, &text)?;
                let _ = writer.shutdown(Shutdown::Both);
                return Ok(());
            }
            Reply::Shutdown(text) => {
                send_reply(&mut writer, &text)?;
                let _ = writer.shutdown(Shutdown::Both);
                shutdown.trigger();
                return Ok(());
            }
        }
    }
}

fn send_reply(writer: &mut TcpStream, text: &str) -> Result<()> {
    writer
        .write_all(format!("{text}\n").as_bytes())
        .context("write reply")?;
    writer.flush().context("flush reply")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::io::Read;

    use crossbeam_channel::Receiver;

    use super::*;
    use crate::control::ControlSignals;
    use crate::playlist::{PlaylistStore, Track};

    struct Harness {
        addr: SocketAddr,
        queue: Receiver<Track>,
        shutdown: ShutdownHandle,
        server: Option<thread::JoinHandle<Result<()>>>,
        _root: tempfile::TempDir,
    }

    impl Harness {
        fn start() -> Self {
            let root = tempfile::tempdir().unwrap();
            let demo = root.path().join("demo");
            fs::create_dir_all(&demo).unwrap();
            fs::write(demo.join("a.mp3"), b"a").unwrap();
            fs::write(demo.join("b.mp3"), b"b").unwrap();

            let store = Arc::new(PlaylistStore::new(root.path(), vec!["*.mp3".to_string()]));
            let (tx, rx) = crossbeam_channel::unbounded();
            let controller = Arc::new(PlaybackController::new(
                store,
                tx,
                rx.clone(),
                ControlSignals::shared(),
            ));
            let server = ControlServer::bind("127.0.0.1:0".parse().unwrap(), controller).unwrap();
            let addr = server.local_addr();
            let shutdown = server.shutdown_handle();
            let server = thread::spawn(move || server.serve());
            Self {
                addr,
                queue: rx,
                shutdown,
                server: Some(server),
                _root: root,
            }
        }

        fn connect(&self) -> Client {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            Client {
                writer: stream.try_clone().unwrap(),
                reader: BufReader::new(stream),
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.trigger();
            if let Some(server) = self.server.take() {
                let _ = server.join();
            }
        }
    }

    struct Client {
        writer: TcpStream,
        reader: BufReader<TcpStream>,
    }

    impl Client {
        fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).unwrap();
        }

        fn read_line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            line.trim_end_matches('\n').to_string()
        }
    }

    #[test]
    fn play_queues_the_playlist() {
        let harness = Harness::start();
        let mut client = harness.connect();
        client.send("PLAY demo\n");
        assert_eq!(client.read_line(), "OK");

        let queued: BTreeSet<String> = harness.queue.try_iter().map(|t| t.title()).collect();
        assert_eq!(queued, BTreeSet::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn errors_keep_the_connection_open() {
        let harness = Harness::start();
        let mut client = harness.connect();
        client.send("BOGU foo\n");
        assert_eq!(client.read_line(), "ERR Unknown Command 'BOGU'");
        client.send("\nhi\n");
        assert_eq!(client.read_line(), "ERR Command not understood 'HI'");
        client.send("PLAY nowhere\n");
        assert_eq!(client.read_line(), "ERR Playlist 'nowhere' not found");
        client.send("PLAY\n");
        assert_eq!(client.read_line(), "ERR PLAY requires a playlist name");
        client.send("FFWD\n");
        assert_eq!(client.read_line(), "OK");
    }

    #[test]
    fn help_and_list_replies() {
        let harness = Harness::start();
        let mut client = harness.connect();
        client.send("HELP\n");
        let help: Vec<String> = (0..7).map(|_| client.read_line()).collect();
        assert!(help[0].starts_with("PLAY "));
        assert!(help[6].starts_with("STFU "));

        client.send("LIST\n");
        assert_eq!(client.read_line(), "demo");
        client.send("LIST demo\n");
        assert_eq!(client.read_line(), "Playlist demo");
        assert!(client.read_line().starts_with(" * "));
        assert!(client.read_line().starts_with(" * "));
    }

    #[test]
    fn overlong_line_is_rejected_and_closed() {
        let harness = Harness::start();
        let mut flood = harness.connect();
        let mut other = harness.connect();

        flood.send(&"X".repeat(MAX_LINE + 1));
        assert_eq!(
            flood.read_line(),
            format!("ERR Command not understood (line longer than {MAX_LINE} bytes)")
        );
        let mut rest = Vec::new();
        assert_eq!(flood.reader.read_to_end(&mut rest).unwrap(), 0);

        other.send("FFWD\n");
        assert_eq!(other.read_line(), "OK");
    }

    #[test]
    fn line_at_the_limit_is_still_parsed() {
        let harness = Harness::start();
        let mut client = harness.connect();
        let name = "n".repeat(MAX_LINE - "PLAY ".len());
        client.send(&format!("PLAY {name}\n"));
        assert_eq!(client.read_line(), format!("ERR Playlist '{name}' not found"));
    }

    #[test]
    fn kthx_closes_only_that_connection() {
        let harness = Harness::start();
        let mut first = harness.connect();
        let mut second = harness.connect();

        first.send("KTHX \n");
        assert_eq!(first.read_line(), "KBAI");
        let mut rest = Vec::new();
        assert_eq!(first.reader.read_to_end(&mut rest).unwrap(), 0);

        second.send("STOP\n");
        assert_eq!(second.read_line(), "OK");
    }

    #[test]
    fn stfu_stops_the_server() {
        let mut harness = Harness::start();
        let mut client = harness.connect();
        client.send("STFU\n");
        assert_eq!(client.read_line(), "Shutting down.");
        let server = harness.server.take().unwrap();
        server.join().unwrap().unwrap();
        assert!(harness.shutdown.is_requested());
    }

    #[test]
    fn wake_addr_maps_unspecified_to_loopback() {
        assert_eq!(
            wake_addr("0.0.0.0:8003".parse().unwrap()),
            "127.0.0.1:8003".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            wake_addr("[::]:8003".parse().unwrap()),
            "[::1]:8003".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            wake_addr("10.0.0.2:9".parse().unwrap()),
            "10.0.0.2:9".parse::<SocketAddr>().unwrap()
        );
    }
}

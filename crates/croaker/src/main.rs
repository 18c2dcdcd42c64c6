//! Croaker: a continuous internet-radio playout engine for tabletop sessions.
//!
//! ## Pipeline
//! 1. **Control**: a line-oriented TCP server accepts `PLAY`, `FFWD`, `STOP`, ... and
//!    fills the playback queue with the tracks of the chosen playlist.
//! 2. **Transcode**: each queued track is piped through ffmpeg into a fixed MP3 profile.
//! 3. **Stream**: a dedicated worker sends frame-aligned chunks to the Icecast relay,
//!    looping silence whenever the queue is empty.
//!
//! ## Modes
//! - `start`: run the server and streamer in the foreground.
//! - `send`: send one command to a running server and print the reply.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use croaker::cli::{Args, Command};
use croaker::config::CroakerConfig;
use croaker::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,croaker=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.cmd {
        Command::Start(start) => {
            let config = CroakerConfig::from_start_args(&start)?;
            runtime::run_server(config, true)
        }
        Command::Send(send) => {
            let reply = runtime::send_command(&send.host, send.port, &send.line())?;
            println!("{reply}");
            Ok(())
        }
    }
}

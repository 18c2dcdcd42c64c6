use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "croaker", version, about = "Continuous internet radio for tabletop sessions")]
pub struct Args {
    /// Log at debug level regardless of RUST_LOG
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the control server and the streamer in the foreground
    Start(StartArgs),

    /// Send one command to a running server and print the reply
    Send(SendArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct StartArgs {
    /// Control server bind host
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Control server bind port
    #[arg(long, env = "PORT", default_value_t = 8003)]
    pub port: u16,

    /// Croaker home directory
    #[arg(long, env = "CROAKER_ROOT", default_value = "~/.dnd/croaker")]
    pub root: PathBuf,

    /// Directory holding one subdirectory per playlist (default: <root>/playlists)
    #[arg(long, env = "PLAYLIST_ROOT")]
    pub playlist_root: Option<PathBuf>,

    /// Comma-separated file name patterns treated as playable media
    #[arg(
        long,
        env = "MEDIA_GLOB",
        value_delimiter = ',',
        default_values = ["*.mp3", "*.flac", "*.m4a"]
    )]
    pub media_glob: Vec<String>,

    /// Playlist loaded at startup
    #[arg(long, env = "SESSION_START", default_value = "session_start")]
    pub session_start: String,

    /// Relay host
    #[arg(long, env = "ICECAST_HOST")]
    pub icecast_host: String,

    /// Relay port
    #[arg(long, env = "ICECAST_PORT")]
    pub icecast_port: u16,

    /// Relay mount point, e.g. /croaker
    #[arg(long, env = "ICECAST_MOUNT")]
    pub icecast_mount: String,

    /// Relay source password
    #[arg(long, env = "ICECAST_PASSWORD", hide_env_values = true)]
    pub icecast_password: String,

    /// Relay source user
    #[arg(long, env = "ICECAST_USER", default_value = "source")]
    pub icecast_user: String,

    /// Public URL advertised to the relay
    #[arg(long, env = "ICECAST_URL")]
    pub icecast_url: Option<String>,

    /// Encoder executable
    #[arg(long, env = "FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// MP3 file streamed when nothing is queued (default: generated silence)
    #[arg(long, env = "CROAKER_SILENCE")]
    pub silence: Option<PathBuf>,

    /// Minimum bytes handed to the relay per send
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 4096)]
    pub chunk_size: usize,

    /// Delay before reconnecting to the relay after a failure (milliseconds)
    #[arg(long, env = "RELAY_RETRY_MS", default_value_t = 5000)]
    pub retry_delay_ms: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SendArgs {
    /// Control server host
    #[arg(long, env = "CONTROLLER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Control server port
    #[arg(long, env = "CONTROLLER_PORT", default_value_t = 8003)]
    pub port: u16,

    /// Command token (PLAY, FFWD, LIST, HELP, STOP, STFU)
    pub command: String,

    /// Command argument, e.g. a playlist name
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

impl SendArgs {
    /// The request line as sent to the server.
    pub fn line(&self) -> String {
        let command = self.command.to_uppercase();
        if self.args.is_empty() {
            command
        } else {
            format!("{command} {}", self.args.join(" "))
        }
    }
}

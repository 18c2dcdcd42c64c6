use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::cli::StartArgs;
use crate::control::DEFAULT_HANDOFF_GRACE;
use crate::frames::StreamProfile;
use crate::relay::IcecastConfig;
use crate::silence::{DEFAULT_SILENCE, SilenceAsset};
use crate::streamer::StreamerOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot resolve bind address {addr}")]
    Bind { addr: String },
    #[error("{0} must not be zero")]
    Zero(&'static str),
    #[error("icecast mount must name a mount point")]
    EmptyMount,
    #[error("at least one media glob is required")]
    NoMediaGlobs,
    #[error("cannot expand {0:?}: home directory is unknown")]
    NoHome(PathBuf),
}

/// Resolved server settings.
#[derive(Clone, Debug)]
pub struct CroakerConfig {
    pub bind: SocketAddr,
    pub root: PathBuf,
    pub playlist_root: PathBuf,
    pub media_globs: Vec<String>,
    pub session_start: String,
    pub icecast: IcecastConfig,
    pub ffmpeg: PathBuf,
    pub silence: Option<PathBuf>,
    pub streamer: StreamerOptions,
    pub handoff_grace: Duration,
}

impl CroakerConfig {
    pub fn from_start_args(args: &StartArgs) -> Result<Self, ConfigError> {
        if args.port == 0 {
            return Err(ConfigError::Zero("port"));
        }
        if args.icecast_port == 0 {
            return Err(ConfigError::Zero("icecast port"));
        }
        if args.chunk_size == 0 {
            return Err(ConfigError::Zero("chunk size"));
        }

        let bind = (args.host.as_str(), args.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::Bind {
                addr: format!("{}:{}", args.host, args.port),
            })?;

        let root = expand_home(&args.root)?;
        let playlist_root = match &args.playlist_root {
            Some(path) => expand_home(path)?,
            None => root.join("playlists"),
        };

        let media_globs: Vec<String> = args
            .media_glob
            .iter()
            .map(|glob| glob.trim().to_string())
            .filter(|glob| !glob.is_empty())
            .collect();
        if media_globs.is_empty() {
            return Err(ConfigError::NoMediaGlobs);
        }

        let profile = StreamProfile::default();
        let mut icecast = IcecastConfig::new(
            args.icecast_host.trim(),
            args.icecast_port,
            normalize_mount(&args.icecast_mount)?,
            args.icecast_password.clone(),
        );
        icecast.user = args.icecast_user.clone();
        icecast.url = args
            .icecast_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        icecast.profile = profile;

        Ok(Self {
            bind,
            root,
            playlist_root,
            media_globs,
            session_start: args.session_start.trim().to_string(),
            icecast,
            ffmpeg: args.ffmpeg.clone(),
            silence: args.silence.as_deref().map(expand_home).transpose()?,
            streamer: StreamerOptions {
                chunk_size: args.chunk_size,
                profile,
                retry_delay: Duration::from_millis(args.retry_delay_ms),
            },
            handoff_grace: DEFAULT_HANDOFF_GRACE,
        })
    }

    /// The configured silence file, or generated silence when none is set.
    pub fn silence_asset(&self) -> Result<SilenceAsset> {
        match &self.silence {
            Some(path) => SilenceAsset::load(path, self.streamer.profile),
            None => SilenceAsset::generate(self.streamer.profile, DEFAULT_SILENCE),
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> Result<PathBuf, ConfigError> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = dirs::home_dir().ok_or_else(|| ConfigError::NoHome(path.to_path_buf()))?;
    Ok(home.join(rest))
}

/// Trim the mount and make sure it starts with `/`.
pub fn normalize_mount(mount: &str) -> Result<String, ConfigError> {
    let mount = mount.trim().trim_start_matches('/');
    if mount.is_empty() {
        return Err(ConfigError::EmptyMount);
    }
    Ok(format!("/{mount}"))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Args, Command};

    fn start_args(extra: &[&str]) -> StartArgs {
        let base = [
            "croaker",
            "start",
            "--host",
            "127.0.0.1",
            "--port",
            "8003",
            "--root",
            "/srv/croaker",
            "--icecast-host",
            " radio.local ",
            "--icecast-port",
            "8000",
            "--icecast-mount",
            "croaker",
            "--icecast-password",
            "hackme",
        ];
        let args = Args::try_parse_from(base.iter().chain(extra.iter())).unwrap();
        match args.cmd {
            Command::Start(start) => start,
            Command::Send(_) => panic!("expected start"),
        }
    }

    #[test]
    fn resolves_paths_and_relay() {
        let config = CroakerConfig::from_start_args(&start_args(&[
            "--media-glob",
            " *.mp3 ,,*.flac",
            "--retry-delay-ms",
            "250",
        ]))
        .unwrap();
        assert_eq!(config.bind, "127.0.0.1:8003".parse::<SocketAddr>().unwrap());
        assert_eq!(config.playlist_root, PathBuf::from("/srv/croaker/playlists"));
        assert_eq!(config.media_globs, vec!["*.mp3", "*.flac"]);
        assert_eq!(config.icecast.host, "radio.local");
        assert_eq!(config.icecast.mount, "/croaker");
        assert_eq!(config.streamer.retry_delay, Duration::from_millis(250));
        assert!(config.silence.is_none());
    }

    #[test]
    fn explicit_playlist_root_wins() {
        let config =
            CroakerConfig::from_start_args(&start_args(&["--playlist-root", "/music/lists"])).unwrap();
        assert_eq!(config.playlist_root, PathBuf::from("/music/lists"));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = CroakerConfig::from_start_args(&start_args(&["--chunk-size", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("chunk size")));
    }

    #[test]
    fn rejects_empty_glob_list() {
        let err = CroakerConfig::from_start_args(&start_args(&["--media-glob", " "])).unwrap_err();
        assert!(matches!(err, ConfigError::NoMediaGlobs));
    }

    #[test]
    fn mount_is_normalized() {
        assert_eq!(normalize_mount("croaker").unwrap(), "/croaker");
        assert_eq!(normalize_mount(" /croaker ").unwrap(), "/croaker");
        assert!(matches!(normalize_mount("/"), Err(ConfigError::EmptyMount)));
    }

    #[test]
    fn home_is_expanded() {
        assert_eq!(expand_home(Path::new("/abs/path")).unwrap(), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home(Path::new("~/.dnd/croaker")).unwrap(),
                home.join(".dnd/croaker")
            );
        }
    }

    #[test]
    fn missing_silence_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silence.mp3");
        let path = path.to_str().unwrap();
        let config = CroakerConfig::from_start_args(&start_args(&["--silence", path])).unwrap();
        assert!(config.silence_asset().is_err());

        let config = CroakerConfig::from_start_args(&start_args(&[])).unwrap();
        assert!(!config.silence_asset().unwrap().bytes().is_empty());
    }
}

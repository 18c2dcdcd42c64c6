//! On-disk playlists.
//!
//! A playlist is a directory under the playlist root holding (usually
//! symlinked) audio files. Resolving it yields the theme track first, if the
//! playlist has one, followed by every other matching file in a fresh random
//! order.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use rand::seq::SliceRandom;

/// Sentinel file name of a playlist's theme track.
pub const THEME_FILE: &str = "_theme.mp3";

/// A playable audio source on disk.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Track {
    path: PathBuf,
}

impl Track {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Title sent to the relay: the file name without its extension.
    pub fn title(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// A resolved playlist: name and play order.
#[derive(Clone, Debug)]
pub struct Playlist {
    name: String,
    tracks: Vec<Track>,
}

impl Playlist {
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }
}

impl fmt::Display for Playlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Playlist {}", self.name)?;
        for track in &self.tracks {
            write!(f, "\n * {track}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("Playlist '{name}' not found")]
    NotFound { name: String, path: PathBuf },
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Resolves playlist names against the playlist root.
#[derive(Clone, Debug)]
pub struct PlaylistStore {
    root: PathBuf,
    patterns: Vec<String>,
}

impl PlaylistStore {
    pub fn new(root: impl Into<PathBuf>, patterns: Vec<String>) -> Self {
        Self {
            root: root.into(),
            patterns,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `name`; names that would escape the root are treated as missing.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, PlaylistError> {
        let not_found = || PlaylistError::NotFound {
            name: name.to_string(),
            path: self.root.join(name),
        };
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(not_found()),
        }
        let path = self.root.join(name);
        if !path.is_dir() {
            return Err(not_found());
        }
        Ok(path)
    }

    /// Resolve `name` to a play order: theme first, the rest shuffled.
    pub fn resolve(&self, name: &str) -> Result<Playlist, PlaylistError> {
        let path = self.path_for(name)?;

        let mut tracks = Vec::new();
        let theme = path.join(THEME_FILE);
        if theme.is_file() {
            tracks.push(Track::new(theme));
        }

        let mut matches = BTreeSet::new();
        collect_matches(&path, &self.patterns, &mut matches)?;
        let mut rest: Vec<Track> = matches
            .into_iter()
            .filter(|p| p.file_name().is_none_or(|n| n != THEME_FILE))
            .map(Track::new)
            .collect();
        rest.shuffle(&mut rand::rng());
        tracks.extend(rest);

        tracing::debug!(playlist = name, tracks = tracks.len(), "resolved playlist");
        Ok(Playlist {
            name: name.to_string(),
            tracks,
        })
    }

    /// Names of every playlist directory under the root, sorted.
    pub fn names(&self) -> Result<Vec<String>, PlaylistError> {
        let io_err = |source| PlaylistError::Io {
            path: self.root.clone(),
            source,
        };
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Recursively collect files under `dir` whose names match any pattern.
///
/// Symlinked files are followed; symlinked directories are not descended into.
fn collect_matches(
    dir: &Path,
    patterns: &[String],
    out: &mut BTreeSet<PathBuf>,
) -> Result<(), PlaylistError> {
    let io_err = |source| PlaylistError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(io_err)?;
        if file_type.is_dir() {
            collect_matches(&path, patterns, out)?;
            continue;
        }
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if patterns.iter().any(|pattern| glob_match(pattern, &name)) {
            out.insert(path);
        }
    }
    Ok(())
}

/// Match a file name against a shell-style pattern supporting `*` and `?`.
///
/// Character classes and braces are not supported; playlist patterns are
/// extension filters like `*.mp3`, which this covers without a glob crate.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some('?') => {
                p += 1;
                n += 1;
            }
            Some(c) if *c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

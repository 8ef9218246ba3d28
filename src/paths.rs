//! Path mapping between Kodi's filesystem view and MPD URIs
//!
//! Kodi reports absolute paths under an arbitrary music root with an
//! arbitrary separator (`/big/music/a/b.mp3`, `smb://nas/music\a\b.mp3`).
//! MPD clients see rooted, `/`-separated URIs relative to that root
//! (`a/b.mp3`). The mapping is pure string rewriting; no filesystem
//! access happens here.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PathError {
    #[error("path is outside the music root: {path}")]
    OutsideRoot { path: String },
    #[error("invalid path: {path}")]
    Invalid { path: String },
}

#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: String,
    separator: String,
}

impl PathTranslator {
    /// `root` is the Kodi-side music root, `separator` the path separator
    /// Kodi uses under it (usually `/`, `\` for Windows shares).
    pub fn new(root: &str, separator: &str) -> Self {
        let mut root = root.to_string();
        while root.ends_with(separator) && !separator.is_empty() {
            root.truncate(root.len() - separator.len());
        }
        Self {
            root,
            separator: separator.to_string(),
        }
    }

    /// Map a Kodi path to the MPD URI clients see.
    ///
    /// Paths not under the music root are refused; directory paths lose
    /// their trailing separator.
    pub fn to_mpd(&self, kodi_path: &str) -> Result<String, PathError> {
        let outside = || PathError::OutsideRoot {
            path: kodi_path.to_string(),
        };

        let rest = kodi_path.strip_prefix(&self.root).ok_or_else(outside)?;
        // Prefix match alone is not enough: "/music" must not claim "/music2"
        if !rest.is_empty() && !rest.starts_with(&self.separator) {
            return Err(outside());
        }

        let mpd = rest.replace(&self.separator, "/");
        Ok(mpd.trim_matches('/').to_string())
    }

    /// Map an MPD URI back to the Kodi path. The empty URI names the
    /// music root itself.
    pub fn to_kodi(&self, mpd_path: &str) -> Result<String, PathError> {
        let invalid = || PathError::Invalid {
            path: mpd_path.to_string(),
        };

        if mpd_path.starts_with('/') {
            return Err(invalid());
        }
        if mpd_path.split('/').any(|segment| segment == "..") {
            return Err(invalid());
        }

        let trimmed = mpd_path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(self.root.clone());
        }
        Ok(format!(
            "{}{}{}",
            self.root,
            self.separator,
            trimmed.replace('/', &self.separator)
        ))
    }

    /// Kodi directory form of an MPD URI: trailing separator, the shape
    /// Kodi's file views use for directory nodes.
    pub fn to_kodi_dir(&self, mpd_path: &str) -> Result<String, PathError> {
        Ok(format!("{}{}", self.to_kodi(mpd_path)?, self.separator))
    }
}

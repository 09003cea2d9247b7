use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// What kind of media a playlist entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Episode,
    Movie,
}

/// A single entry in the shared playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub kind: ItemKind,
    /// Full path to the media file
    pub path: String,
    /// Duration in milliseconds, informational only
    #[serde(default)]
    pub duration: u64,
    /// Movie title, or episode title for episodic items
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub show_title: String,
    #[serde(default)]
    pub episode: u32,
    #[serde(default)]
    pub season: u32,
}

impl PlaylistItem {
    /// Create a movie entry titled after the file name
    pub fn movie(path: impl Into<String>) -> Self {
        let path = path.into();
        let title = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone());

        Self {
            kind: ItemKind::Movie,
            path,
            duration: 0,
            title,
            show_title: String::new(),
            episode: 0,
            season: 0,
        }
    }
}

/// Ordered items plus the play head.
///
/// `current_index` is signed: the previous-item command may push it below zero,
/// and the engine clamps it back before each playback attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub items: Vec<PlaylistItem>,
    pub current_index: i64,
}

impl Playlist {
    pub fn len(&self) -> i64 {
        self.items.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Parse a plain-text playlist: one media path per line, blank lines ignored
pub fn parse_playlist(content: &str) -> Vec<PlaylistItem> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            debug!("Adding {} to the playlist", line);
            PlaylistItem::movie(line)
        })
        .collect()
}

/// Load a plain-text playlist file
pub fn load_playlist_file<P: AsRef<Path>>(path: P) -> Result<Vec<PlaylistItem>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read playlist file: {}", path.display()))?;

    let items = parse_playlist(&content);
    info!("Loaded {} playlist items from {}", items.len(), path.display());
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_playlist_skips_blank_lines() {
        let items = parse_playlist("/media/a.mp4\n\n  /media/show/b.mkv  \n");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, "/media/a.mp4");
        assert_eq!(items[0].title, "a.mp4");
        assert_eq!(items[1].path, "/media/show/b.mkv");
        assert_eq!(items[1].title, "b.mkv");
        assert!(items.iter().all(|i| i.kind == ItemKind::Movie));
    }

    #[test]
    fn test_load_playlist_file() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "/tmp/one.mp4")?;
        writeln!(file, "/tmp/two.mp4")?;

        let items = load_playlist_file(file.path())?;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].title, "two.mp4");
        Ok(())
    }

    #[test]
    fn test_load_missing_playlist_file_fails() {
        assert!(load_playlist_file("/definitely/not/here.txt").is_err());
    }

    #[test]
    fn test_playlist_json_shape() {
        let playlist = Playlist {
            items: vec![PlaylistItem::movie("/m/a.mp4")],
            current_index: 0,
        };
        let json = serde_json::to_value(&playlist).unwrap();
        assert_eq!(json["currentIndex"], 0);
        assert_eq!(json["items"][0]["kind"], "movie");
        assert_eq!(json["items"][0]["showTitle"], "");
    }
}

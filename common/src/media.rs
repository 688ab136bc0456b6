//! Collaborator interfaces at the edge of the streaming core.
//!
//! Tag extraction and actual playback live outside this workspace. The
//! streaming core only needs these contracts; the binaries plug in the
//! minimal implementations below.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

/// Size of the ID3v1 trailer at the end of a tagged file.
pub const ID3V1_SIZE: usize = 128;

/// Tag information for one song.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    // ---
    pub title: String,
    pub artist: String,
    pub duration_secs: Option<f64>,
}

impl TrackMetadata {
    // ---
    pub fn unknown() -> Self {
        // ---
        Self {
            title: "Unknown".to_string(),
            artist: "Unknown".to_string(),
            duration_secs: None,
        }
    }
}

/// Reads tags from an audio file.
pub trait MetadataReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<TrackMetadata>;
}

/// Hands a local file to the platform media player.
pub trait PlaybackSink: Send + Sync {
    fn play(&self, path: &Path) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Derives metadata from an `Artist - Title.ext` file name.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileNameMetadata;

impl MetadataReader for FileNameMetadata {
    fn read(&self, path: &Path) -> Result<TrackMetadata> {
        // ---
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut meta = TrackMetadata::unknown();
        match stem.split_once(" - ") {
            Some((artist, title)) => {
                meta.artist = artist.trim().to_string();
                meta.title = title.trim().to_string();
            }
            None if !stem.is_empty() => meta.title = stem,
            None => {}
        }
        Ok(meta)
    }
}

/// Reads the ID3v1 trailer (the last 128 bytes, starting with `TAG`).
///
/// Files without a trailer, or with blank fields, report `Unknown`. This is
/// the reader for cached songs, whose file names carry no tag information.
#[derive(Debug, Default, Clone, Copy)]
pub struct Id3v1Metadata;

impl Id3v1Metadata {
    // ---
    /// Parses a trailer that has already been read into memory.
    pub fn parse(trailer: &[u8]) -> TrackMetadata {
        // ---
        let mut meta = TrackMetadata::unknown();
        if trailer.len() != ID3V1_SIZE || !trailer.starts_with(b"TAG") {
            return meta;
        }

        if let Some(title) = tag_field(&trailer[3..33]) {
            meta.title = title;
        }
        if let Some(artist) = tag_field(&trailer[33..63]) {
            meta.artist = artist;
        }
        meta
    }
}

impl MetadataReader for Id3v1Metadata {
    fn read(&self, path: &Path) -> Result<TrackMetadata> {
        // ---
        let mut file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let len = file.metadata()?.len();
        if len < ID3V1_SIZE as u64 {
            return Ok(TrackMetadata::unknown());
        }

        let mut trailer = [0u8; ID3V1_SIZE];
        file.seek(SeekFrom::End(-(ID3V1_SIZE as i64)))?;
        file.read_exact(&mut trailer)
            .with_context(|| format!("failed to read tag of {}", path.display()))?;
        Ok(Self::parse(&trailer))
    }
}

/// A fixed-width Latin-1 field, NUL or space padded.
fn tag_field(raw: &[u8]) -> Option<String> {
    // ---
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let text: String = raw[..end].iter().map(|b| char::from(*b)).collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Playback sink that only logs what it would play.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPlayback;

impl PlaybackSink for LoggingPlayback {
    fn play(&self, path: &Path) -> Result<()> {
        info!("Playback requested: {}", path.display());
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        info!("Playback paused");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        info!("Playback stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_file_name_metadata() {
        // ---
        let meta = FileNameMetadata
            .read(Path::new("/music/Nina Simone - Sinnerman.mp3"))
            .expect("read");

        assert_eq!(meta.artist, "Nina Simone");
        assert_eq!(meta.title, "Sinnerman");
    }

    #[test]
    fn test_file_name_without_artist() {
        // ---
        let meta = FileNameMetadata.read(Path::new("track01.mp3")).expect("read");

        assert_eq!(meta.title, "track01");
        assert_eq!(meta.artist, "Unknown");
    }

    fn trailer(title: &str, artist: &str) -> Vec<u8> {
        // ---
        let mut tag = vec![0u8; ID3V1_SIZE];
        tag[..3].copy_from_slice(b"TAG");
        tag[3..3 + title.len()].copy_from_slice(title.as_bytes());
        tag[33..33 + artist.len()].copy_from_slice(artist.as_bytes());
        tag
    }

    #[test]
    fn test_id3v1_tag_read_from_file() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abc123.audio");
        let mut bytes = vec![0xFFu8; 4000];
        bytes.extend(trailer("Sinnerman", "Nina Simone"));
        std::fs::write(&path, bytes).expect("write");

        let meta = Id3v1Metadata.read(&path).expect("read");
        assert_eq!(meta.title, "Sinnerman");
        assert_eq!(meta.artist, "Nina Simone");
    }

    #[test]
    fn test_untagged_file_is_unknown() {
        // ---
        let dir = tempfile::tempdir().expect("tempdir");
        let short = dir.path().join("short.audio");
        std::fs::write(&short, [1u8; 10]).expect("write");
        let plain = dir.path().join("plain.audio");
        std::fs::write(&plain, [1u8; 1000]).expect("write");

        assert_eq!(Id3v1Metadata.read(&short).expect("read"), TrackMetadata::unknown());
        assert_eq!(Id3v1Metadata.read(&plain).expect("read"), TrackMetadata::unknown());
    }

    #[test]
    fn test_blank_tag_fields_stay_unknown() {
        // ---
        let meta = Id3v1Metadata::parse(&trailer("   ", "Band"));

        assert_eq!(meta.title, "Unknown");
        assert_eq!(meta.artist, "Band");
    }
}

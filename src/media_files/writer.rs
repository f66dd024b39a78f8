use crate::config::{FilenameFormat, SharedSettings};
use crate::download_manager::{AudioStream, MediaWriter, TrackDescriptor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const MAX_FILENAME_CHARS: usize = 200;
const AUDIO_EXTENSION: &str = "flac";

/// Replaces characters that are invalid in file names on common filesystems.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_FILENAME_CHARS)
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        "Unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

/// File stem for a track under the given naming format.
pub fn track_file_stem(format: FilenameFormat, descriptor: &TrackDescriptor) -> String {
    let title = descriptor.title.as_str();
    let artists = descriptor.artists_display();
    let stem = match format {
        FilenameFormat::TitleArtist if !artists.is_empty() => format!("{} - {}", title, artists),
        FilenameFormat::ArtistTitle if !artists.is_empty() => format!("{} - {}", artists, title),
        _ => title.to_string(),
    };
    sanitize_filename(&stem)
}

/// Writes audio under the configured download directory.
///
/// Audio is streamed into `<final>.<item_id>.part` next to the final file and
/// renamed into place once complete.
pub struct FsMediaWriter {
    settings: SharedSettings,
}

impl FsMediaWriter {
    pub fn new(settings: SharedSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl MediaWriter for FsMediaWriter {
    fn final_path(&self, descriptor: &TrackDescriptor) -> PathBuf {
        let settings = self.settings.read().unwrap();
        let stem = track_file_stem(settings.filename_format, descriptor);
        settings
            .download_path
            .join(format!("{}.{}", stem, AUDIO_EXTENSION))
    }

    fn temp_path(&self, item_id: &str, descriptor: &TrackDescriptor) -> PathBuf {
        let final_path = self.final_path(descriptor);
        let mut name = final_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.part", item_id));
        final_path.with_file_name(name)
    }

    async fn write(&self, mut stream: AudioStream, path: &Path) -> Result<u64> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {:?}", path))?;

        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Audio stream failed")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {:?}", path))?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(
            "Wrote {:#} to {:?}",
            byte_unit::Byte::from(written),
            path
        );
        Ok(written)
    }

    async fn finalize(&self, temp: &Path, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(temp, destination)
            .await
            .with_context(|| format!("Failed to move {:?} to {:?}", temp, destination))?;
        info!("Saved {:?}", destination);
        Ok(())
    }

    async fn discard(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {:?}: {}", path, e),
        }
    }
}

//! Utterance recording
//!
//! When recording is enabled, every session's normalized PCM is written
//! incrementally to `{dir}/{device_id}/{session_id}.wav` and finalized
//! when the session closes. Recording is strictly best-effort: any
//! failure here is logged and never touches the recognition path.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use serde::Serialize;
use tracing::warn;

use crate::errors::{GatewayError, GatewayResult};

/// Incremental WAV writer for one session.
pub struct WavRecorder {
    writer: WavWriter<BufWriter<fs::File>>,
    path: PathBuf,
}

impl WavRecorder {
    /// Create the session's WAV file. Only 16-bit PCM is captured; other
    /// depths are declined (the recognition path is unaffected).
    pub fn create(
        root: &Path,
        device_id: &str,
        session_id: &str,
        sample_rate: u32,
        bits: u16,
        channels: u16,
    ) -> GatewayResult<Self> {
        if bits != 16 {
            return Err(GatewayError::InvalidAudio(format!(
                "recording supports 16-bit PCM only, got {bits}-bit"
            )));
        }
        let dir = root.join(sanitize(device_id));
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.wav", sanitize(session_id)));
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)
            .map_err(|e| GatewayError::Backend(format!("cannot create {}: {e}", path.display())))?;
        Ok(Self { writer, path })
    }

    /// Append little-endian 16-bit PCM bytes. A trailing odd byte is
    /// dropped.
    pub fn write_pcm(&mut self, pcm: &[u8]) {
        for pair in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            if let Err(e) = self.writer.write_sample(sample) {
                warn!(path = %self.path.display(), error = %e, "recording write failed");
                return;
            }
        }
    }

    /// Flush headers and close the file.
    pub fn finalize(self) -> GatewayResult<PathBuf> {
        let path = self.path.clone();
        self.writer
            .finalize()
            .map_err(|e| GatewayError::Backend(format!("cannot finalize {}: {e}", path.display())))?;
        Ok(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One recording on disk, as listed by the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingInfo {
    pub file: String,
    pub size_bytes: u64,
    /// Last modification time (Unix ms).
    pub modified: u64,
}

/// List a device's recordings, newest first.
pub fn list_recordings(root: &Path, device_id: &str) -> GatewayResult<Vec<RecordingInfo>> {
    let dir = root.join(sanitize(device_id));
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut recordings = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".wav") {
            continue;
        }
        let meta = entry.metadata()?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        recordings.push(RecordingInfo {
            file: name,
            size_bytes: meta.len(),
            modified,
        });
    }
    recordings.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(recordings)
}

/// Keep ids usable as file names.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_round_trip_sample_count() {
        let tmp = tempfile::tempdir().unwrap();
        let mut recorder =
            WavRecorder::create(tmp.path(), "esp32-1", "sess-1", 16_000, 16, 1).unwrap();

        // 100 samples of 16-bit PCM.
        let pcm: Vec<u8> = (0..100i16).flat_map(|s| s.to_le_bytes()).collect();
        recorder.write_pcm(&pcm);
        let path = recorder.finalize().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 100);
    }

    #[test]
    fn test_non_16bit_depth_declined() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(WavRecorder::create(tmp.path(), "esp32-1", "sess-1", 16_000, 24, 1).is_err());
    }

    #[test]
    fn test_listing_sorts_newest_first_and_skips_foreign_files() {
        let tmp = tempfile::tempdir().unwrap();
        for session in ["a", "b"] {
            let mut rec =
                WavRecorder::create(tmp.path(), "esp32-1", session, 16_000, 16, 1).unwrap();
            rec.write_pcm(&[0, 0]);
            rec.finalize().unwrap();
        }
        fs::write(tmp.path().join("esp32-1").join("notes.txt"), b"x").unwrap();

        let listed = list_recordings(tmp.path(), "esp32-1").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.file.ends_with(".wav")));
    }

    #[test]
    fn test_listing_unknown_device_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list_recordings(tmp.path(), "ghost").unwrap().is_empty());
    }

    #[test]
    fn test_ids_are_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder =
            WavRecorder::create(tmp.path(), "../evil", "sess/1", 16_000, 16, 1).unwrap();
        let path = recorder.path().to_path_buf();
        assert!(path.starts_with(tmp.path()));
        assert!(path.to_string_lossy().contains(".._evil"));
    }
}

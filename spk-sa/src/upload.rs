//! Audio upload boundary
//!
//! Checks applied before a recording is stored: size limit, content sniffing
//! (magic bytes, not the client's claim), filename sanitization, and a containment check
//! on the final path. The stored file is probed for its duration.

use lofty::prelude::AudioFile;
use lofty::probe::Probe;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_STEM_LEN: usize = 64;

/// Upload rejection
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload is empty")]
    Empty,

    #[error("Upload of {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("Unsupported audio type: {0}")]
    UnsupportedType(String),

    #[error("Unrecognized audio content")]
    UnrecognizedContent,

    #[error("Resolved path escapes the uploads directory")]
    PathEscape,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What uploads are accepted
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPolicy {
    /// Lowercase extensions without dot
    pub allowed_extensions: Vec<String>,
    /// Sniffed MIME types accepted
    pub allowed_mime_types: Vec<String>,
    pub max_bytes: u64,
    /// Extension forced onto names without an allowed one
    pub default_extension: String,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: ["wav", "webm", "mp3", "m4a", "ogg", "flac"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_mime_types: [
                "audio/x-wav",
                "audio/wav",
                "audio/webm",
                "video/webm",
                "audio/mpeg",
                "audio/m4a",
                "audio/mp4",
                "audio/ogg",
                "audio/x-flac",
                "audio/flac",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_bytes: 50 * 1024 * 1024,
            default_extension: "wav".to_string(),
        }
    }
}

/// Stored recording
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAudio {
    /// File name relative to the uploads directory
    pub audio_ref: String,
    pub path: PathBuf,
    pub mime_type: String,
    pub size: u64,
    /// Probed duration, `None` when the container does not report one
    pub duration_seconds: Option<f64>,
}

impl UploadPolicy {
    /// Safe stored file name for a client-supplied name
    ///
    /// Keeps ASCII alphanumerics of the stem (capped) and keeps the extension only if it
    /// is allowed. The session and upload ids prefix the name, so no two writes share a
    /// path.
    pub fn sanitize_filename(&self, original: &str, session_id: Uuid, upload_id: Uuid) -> String {
        // Only the final path component counts
        let base = original.rsplit(['/', '\\']).next().unwrap_or_default();

        let (stem, ext) = match base.rsplit_once('.') {
            Some((stem, ext)) => (stem, ext.to_ascii_lowercase()),
            None => (base, String::new()),
        };

        let mut clean: String = stem.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        clean.truncate(MAX_STEM_LEN);
        if clean.is_empty() {
            clean.push_str("recording");
        }

        let ext = if self.allowed_extensions.contains(&ext) {
            ext
        } else {
            self.default_extension.clone()
        };

        format!("{}_{}_{}.{}", session_id.simple(), upload_id.simple(), clean, ext)
    }

    /// Stored file name whose extension follows the sniffed content
    pub fn stored_name(&self, original: &str, session_id: Uuid, upload_id: Uuid, mime_type: &str) -> String {
        let name = self.sanitize_filename(original, session_id, upload_id);
        match extension_for_mime(mime_type) {
            Some(ext) if self.allowed_extensions.iter().any(|e| e == ext) => match name.rsplit_once('.') {
                Some((base, current)) if current != ext => format!("{}.{}", base, ext),
                _ => name,
            },
            _ => name,
        }
    }

    /// Size and content checks; returns the sniffed MIME type
    pub fn validate(&self, bytes: &[u8]) -> Result<&'static str, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            return Err(UploadError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }

        let kind = infer::get(bytes).ok_or(UploadError::UnrecognizedContent)?;
        let mime = kind.mime_type();
        if !self.allowed_mime_types.iter().any(|m| m == mime) {
            return Err(UploadError::UnsupportedType(mime.to_string()));
        }
        Ok(mime)
    }

    /// Validate and write a recording into `uploads_dir`
    pub async fn store(
        &self,
        uploads_dir: &Path,
        session_id: Uuid,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<StoredAudio, UploadError> {
        let mime_type = self.validate(bytes)?;

        tokio::fs::create_dir_all(uploads_dir).await?;
        let audio_ref = self.stored_name(original_name, session_id, Uuid::new_v4(), mime_type);
        let path = contained_path(uploads_dir, &audio_ref)?;

        let tmp_path = path.with_extension("part");
        if let Err(e) = write_new(&tmp_path, &path, bytes).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
                debug!("No partial upload to remove at {}: {}", tmp_path.display(), cleanup);
            }
            return Err(e.into());
        }

        let probe_path = path.clone();
        let duration_seconds = tokio::task::spawn_blocking(move || probe_duration(&probe_path))
            .await
            .unwrap_or_else(|e| {
                warn!("Duration probe task failed: {}", e);
                None
            });

        debug!(
            session_id = %session_id,
            audio_ref = %audio_ref,
            mime_type,
            size = bytes.len(),
            "Stored uploaded audio"
        );

        Ok(StoredAudio {
            audio_ref,
            path,
            mime_type: mime_type.to_string(),
            size: bytes.len() as u64,
            duration_seconds,
        })
    }
}

/// Write `bytes` to a fresh `tmp_path`, then move it to `path`
async fn write_new(tmp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp_path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp_path, path).await
}

/// Canonical extension for a sniffed MIME type
pub fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        "audio/x-wav" | "audio/wav" => Some("wav"),
        "audio/webm" | "video/webm" => Some("webm"),
        "audio/mpeg" => Some("mp3"),
        "audio/m4a" | "audio/mp4" => Some("m4a"),
        "audio/ogg" => Some("ogg"),
        "audio/x-flac" | "audio/flac" => Some("flac"),
        _ => None,
    }
}

/// Join `name` onto `dir`, rejecting anything that resolves outside `dir`
pub fn contained_path(dir: &Path, name: &str) -> Result<PathBuf, UploadError> {
    let root = dir.canonicalize()?;
    let candidate = root.join(name);

    let parent = candidate.parent().ok_or(UploadError::PathEscape)?;
    if parent != root || candidate.file_name().is_none() {
        return Err(UploadError::PathEscape);
    }
    Ok(candidate)
}

/// Audio duration in seconds as reported by the container
pub fn probe_duration(path: &Path) -> Option<f64> {
    match Probe::open(path).and_then(|probe| probe.read()) {
        Ok(tagged_file) => {
            let secs = tagged_file.properties().duration().as_secs_f64();
            (secs > 0.0).then_some(secs)
        }
        Err(e) => {
            debug!("Duration probe failed for {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wav_bytes(seconds: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..(8000 * seconds) {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_sanitize_strips_path_and_symbols() {
        let policy = UploadPolicy::default();
        let (id, upload) = (Uuid::new_v4(), Uuid::new_v4());
        let name = policy.sanitize_filename("../../etc/my pitch (final)!.WAV", id, upload);
        assert_eq!(name, format!("{}_{}_mypitchfinal.wav", id.simple(), upload.simple()));
    }

    #[test]
    fn test_sanitize_forces_allowed_extension() {
        let policy = UploadPolicy::default();
        let (id, upload) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(policy.sanitize_filename("payload.exe", id, upload).ends_with("_payload.wav"));
        assert!(policy.sanitize_filename("...", id, upload).ends_with("_recording.wav"));
    }

    #[test]
    fn test_sanitize_caps_length() {
        let policy = UploadPolicy::default();
        let long = format!("{}.webm", "a".repeat(300));
        let name = policy.sanitize_filename(&long, Uuid::new_v4(), Uuid::new_v4());
        let stem = name.split('_').nth(2).unwrap();
        assert_eq!(stem, format!("{}.webm", "a".repeat(64)));
    }

    #[test]
    fn test_validate_rejects_non_audio() {
        let policy = UploadPolicy::default();
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert!(matches!(policy.validate(&png), Err(UploadError::UnsupportedType(_))));
        assert!(matches!(policy.validate(b"just text"), Err(UploadError::UnrecognizedContent)));
        assert!(matches!(policy.validate(&[]), Err(UploadError::Empty)));
    }

    #[test]
    fn test_validate_size_limit() {
        let policy = UploadPolicy {
            max_bytes: 16,
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(&wav_bytes(1)),
            Err(UploadError::TooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_contained_path_rejects_escape() {
        let dir = TempDir::new().unwrap();
        assert!(contained_path(dir.path(), "ok.wav").is_ok());
        assert!(matches!(
            contained_path(dir.path(), "../evil.wav"),
            Err(UploadError::PathEscape)
        ));
    }

    #[tokio::test]
    async fn test_store_wav_probes_duration() {
        let dir = TempDir::new().unwrap();
        let policy = UploadPolicy::default();
        let id = Uuid::new_v4();

        let stored = policy
            .store(dir.path(), id, "take1.wav", &wav_bytes(2))
            .await
            .unwrap();

        assert!(stored.path.exists());
        assert!(stored.audio_ref.ends_with("_take1.wav"));
        let duration = stored.duration_seconds.unwrap();
        assert!((duration - 2.0).abs() < 0.1, "unexpected duration {}", duration);
    }

    #[test]
    fn test_stored_name_follows_sniffed_content() {
        let policy = UploadPolicy::default();
        let (id, upload) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(policy
            .stored_name("talk.mp3", id, upload, "audio/x-wav")
            .ends_with("_talk.wav"));
        assert!(policy
            .stored_name("talk.webm", id, upload, "video/webm")
            .ends_with("_talk.webm"));
    }

    #[tokio::test]
    async fn test_same_name_uploads_get_separate_files() {
        let dir = TempDir::new().unwrap();
        let policy = UploadPolicy::default();
        let id = Uuid::new_v4();

        let first = policy.store(dir.path(), id, "talk.wav", &wav_bytes(1)).await.unwrap();
        let second = policy.store(dir.path(), id, "talk.wav", &wav_bytes(2)).await.unwrap();
        assert_ne!(first.path, second.path);

        // The losing write is discarded; the kept one stays intact
        tokio::fs::remove_file(&second.path).await.unwrap();
        assert!(first.path.exists());
        assert_eq!(probe_duration(&first.path).map(|d| d.round()), Some(1.0));
    }

    #[tokio::test]
    async fn test_mislabelled_upload_stored_under_content_extension() {
        let dir = TempDir::new().unwrap();
        let stored = UploadPolicy::default()
            .store(dir.path(), Uuid::new_v4(), "x.mp3", &wav_bytes(1))
            .await
            .unwrap();

        assert!(stored.audio_ref.ends_with("_x.wav"));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "part"))
            .collect();
        assert!(leftovers.is_empty());
    }
}

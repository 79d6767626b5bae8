//! External transcoder (ffmpeg) invocation
//!
//! Recall hands the decompressed session segments to ffmpeg to be
//! concatenated into one audio-only output container. Each segment is
//! materialized to a scratch file; the scratch files are dropped (and
//! deleted) on every exit path, success or failure.

use crate::error::TranscodeError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::process::Command;

/// Concatenating transcoder backed by an external ffmpeg binary
pub struct Transcoder {
    ffmpeg: PathBuf,
}

impl Transcoder {
    /// Resolve the ffmpeg binary from an explicit configured path or the
    /// usual locations.
    pub fn new(configured_path: Option<&Path>) -> Result<Self, TranscodeError> {
        let ffmpeg = resolve_ffmpeg(configured_path)?;
        tracing::debug!(ffmpeg = %ffmpeg.display(), "transcoder ready");
        Ok(Self { ffmpeg })
    }

    /// Concatenate ordered audio segments into a single output file.
    ///
    /// Input order is preserved exactly; the caller passes segments in
    /// chronological order and the output plays in that order.
    pub async fn concat(&self, segments: &[Vec<u8>]) -> Result<NamedTempFile, TranscodeError> {
        if segments.is_empty() {
            return Err(TranscodeError::NoInput);
        }

        let mut inputs = Vec::with_capacity(segments.len());
        for segment in segments {
            let mut file = tempfile::Builder::new()
                .prefix("earshot_in_")
                .suffix(".ogg")
                .tempfile()?;
            file.write_all(segment)?;
            file.flush()?;
            inputs.push(file);
        }

        let output = tempfile::Builder::new()
            .prefix("earshot_out_")
            .suffix(".ogg")
            .tempfile()?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-nostdin")
            .arg("-y")
            .arg("-loglevel")
            .arg("error");
        for input in &inputs {
            cmd.arg("-i").arg(input.path());
        }
        cmd.arg("-filter_complex")
            .arg(format!("concat=n={}:v=0:a=1", inputs.len()))
            .arg(output.path());

        tracing::debug!(inputs = inputs.len(), "running ffmpeg concat");
        let result = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(TranscodeError::Failed {
                status: result.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        // Scratch inputs drop (and unlink) here; the output handle stays
        // readable until the caller drops it.
        Ok(output)
    }
}

fn resolve_ffmpeg(configured_path: Option<&Path>) -> Result<PathBuf, TranscodeError> {
    if let Some(path) = configured_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(TranscodeError::ConfiguredPathMissing(
            path.display().to_string(),
        ));
    }

    let candidates = [
        which::which("ffmpeg").ok(),
        Some(PathBuf::from("/usr/local/bin/ffmpeg")),
        Some(PathBuf::from("/usr/bin/ffmpeg")),
    ];
    for candidate in candidates.into_iter().flatten() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(TranscodeError::FfmpegNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_path_missing() {
        let result = Transcoder::new(Some(Path::new("/nonexistent/ffmpeg")));
        assert!(matches!(
            result,
            Err(TranscodeError::ConfiguredPathMissing(_))
        ));
    }

    #[test]
    fn test_configured_path_used_verbatim() {
        // Any existing file is accepted; tests exploit this to substitute
        // a fake transcoder.
        let transcoder = Transcoder::new(Some(Path::new("/bin/sh"))).unwrap();
        assert_eq!(transcoder.ffmpeg, PathBuf::from("/bin/sh"));
    }

    #[tokio::test]
    async fn test_no_input_rejected() {
        let transcoder = Transcoder::new(Some(Path::new("/bin/sh"))).unwrap();
        let result = transcoder.concat(&[]).await;
        assert!(matches!(result, Err(TranscodeError::NoInput)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_surfaced() {
        // /bin/false ignores its arguments and exits 1.
        let transcoder = Transcoder::new(Some(Path::new("/bin/false"))).unwrap();
        let result = transcoder.concat(&[vec![1, 2, 3]]).await;
        assert!(matches!(result, Err(TranscodeError::Failed { .. })));
    }
}

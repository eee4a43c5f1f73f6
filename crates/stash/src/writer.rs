//! Response-body files and Content-Type extension mapping.
//!
//! Every request writes exactly one file under its sequence directory:
//! `seqNNN-<sequence>/reqNNN-<key>-response.<ext>`. The extension is derived
//! from the response Content-Type; unknown or missing types fall back to
//! `.txt`. Paths are unique by construction, so concurrent workers never
//! collide on the file system.

use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors that can occur while writing response artifacts.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Filesystem operation failed.
    #[error("IO operation failed on path {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Required builder attribute was not provided.
    #[error("Missing required builder attribute: {0}")]
    MissingBuilderAttribute(String),
}

/// Maps a response Content-Type to the archived file extension.
///
/// The primary media type is matched lower-cased with parameters stripped;
/// anything unrecognized (including an absent header) maps to `txt`.
pub fn extension_for(content_type: Option<&str>) -> &'static str {
    let Some(content_type) = content_type else {
        return "txt";
    };
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match media_type.as_str() {
        "application/json" => "json",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "application/xml" | "text/xml" => "xml",
        "application/pdf" => "pdf",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        _ => "txt",
    }
}

/// Writes response bodies into the run directory tree.
#[derive(Debug)]
pub struct ArtifactWriter {
    /// Root of the current run (`<out>/<stash-name>/<run-timestamp>`).
    run_root: PathBuf,
}

impl ArtifactWriter {
    /// Directory for one sequence: `seqNNN-<name>`.
    pub fn sequence_dir(&self, sequence_index: usize, sequence_name: &str) -> PathBuf {
        self.run_root
            .join(format!("seq{sequence_index:03}-{sequence_name}"))
    }

    /// Writes one response body (or a diagnostic note when the request
    /// produced no body) and returns the file path.
    pub fn write_response(
        &self,
        sequence_index: usize,
        sequence_name: &str,
        request_index: usize,
        request_key: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<PathBuf, Error> {
        let dir = self.sequence_dir(sequence_index, sequence_name);
        std::fs::create_dir_all(&dir).map_err(|source| Error::Io {
            path: dir.clone(),
            source,
        })?;
        let ext = extension_for(content_type);
        let path = dir.join(format!("req{request_index:03}-{request_key}-response.{ext}"));
        std::fs::write(&path, body).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), bytes = body.len(), "response body written");
        Ok(path)
    }
}

/// Builder for [`ArtifactWriter`].
#[derive(Debug, Default)]
pub struct ArtifactWriterBuilder {
    run_root: Option<PathBuf>,
}

impl ArtifactWriterBuilder {
    pub fn new() -> ArtifactWriterBuilder {
        ArtifactWriterBuilder {
            ..Default::default()
        }
    }

    pub fn run_root(mut self, run_root: &Path) -> Self {
        self.run_root = Some(run_root.to_path_buf());
        self
    }

    pub fn build(self) -> Result<ArtifactWriter, Error> {
        Ok(ArtifactWriter {
            run_root: self
                .run_root
                .ok_or_else(|| Error::MissingBuilderAttribute("run_root".to_string()))?,
        })
    }
}

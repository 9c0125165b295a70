//! `multipart/form-data` uploads.
//!
//! The body has already been buffered (bounded by `web.limits.upload`).
//! File parts are written to `web.upload.dir` under generated names; plain
//! parts become request variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::http::response::StatusCode;
use crate::http::session::new_session_id;

/// An uploaded file saved on disk.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Form field name
    pub name: String,
    /// Client supplied file name (validated, never used as a path)
    pub client_filename: String,
    pub content_type: Option<String>,
    pub path: PathBuf,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("malformed multipart body")]
    Malformed,
    #[error("missing multipart boundary")]
    NoBoundary,
    #[error("invalid upload filename")]
    BadFilename,
    #[error("upload too large")]
    TooLarge,
    #[error("too many uploads")]
    TooMany,
    #[error("cannot save upload")]
    Io,
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::TooLarge | UploadError::TooMany => StatusCode::PayloadTooLarge,
            UploadError::Io => StatusCode::InternalServerError,
            _ => StatusCode::BadRequest,
        }
    }
}

/// One part of a multipart body, borrowing its data.
#[derive(Debug)]
pub struct Part<'a> {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: &'a [u8],
}

/// Extracts `boundary=` from a `Content-Type` value.
pub fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        if !k.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let v = v.trim().trim_matches('"');
        (!v.is_empty() && v.len() <= 70).then(|| v.to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits a multipart body into parts.
pub fn parse_multipart<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<Part<'a>>, UploadError> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut pos = find(body, delimiter).ok_or(UploadError::Malformed)? + delimiter.len();
    let mut parts = Vec::new();
    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        let rest = rest.strip_prefix(b"\r\n").ok_or(UploadError::Malformed)?;
        pos = body.len() - rest.len();

        let head_end = find(rest, b"\r\n\r\n").ok_or(UploadError::Malformed)?;
        let head = std::str::from_utf8(&rest[..head_end]).map_err(|_| UploadError::Malformed)?;
        let data_start = pos + head_end + 4;

        let mut next = Vec::with_capacity(delimiter.len() + 2);
        next.extend_from_slice(b"\r\n");
        next.extend_from_slice(delimiter);
        let data_len = find(&body[data_start..], &next).ok_or(UploadError::Malformed)?;

        let mut part = Part {
            name: String::new(),
            filename: None,
            content_type: None,
            data: &body[data_start..data_start + data_len],
        };
        for line in head.split("\r\n") {
            let (key, value) = line.split_once(':').ok_or(UploadError::Malformed)?;
            if key.trim().eq_ignore_ascii_case("Content-Disposition") {
                for param in value.split(';').skip(1) {
                    let Some((k, v)) = param.split_once('=') else { continue };
                    let v = v.trim().trim_matches('"').to_string();
                    match k.trim().to_ascii_lowercase().as_str() {
                        "name" => part.name = v,
                        "filename" => part.filename = Some(v),
                        _ => {}
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("Content-Type") {
                part.content_type = Some(value.trim().to_string());
            }
        }
        parts.push(part);
        pos = data_start + data_len + next.len();
    }
}

/// Client file names are informational only, but ones that look like
/// paths are refused outright.
pub fn valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0', ':'])
}

/// Saves file parts and collects form fields.
///
/// On any error the files written so far are removed.
pub fn save_uploads(
    parts: &[Part<'_>],
    dir: &Path,
    max_size: usize,
    max_count: usize,
    vars: &mut HashMap<String, String>,
) -> Result<Vec<Upload>, UploadError> {
    let mut uploads = Vec::new();
    match save_parts(parts, dir, max_size, max_count, vars, &mut uploads) {
        Ok(()) => Ok(uploads),
        Err(e) => {
            remove_uploads(&uploads);
            Err(e)
        }
    }
}

fn save_parts(
    parts: &[Part<'_>],
    dir: &Path,
    max_size: usize,
    max_count: usize,
    vars: &mut HashMap<String, String>,
    uploads: &mut Vec<Upload>,
) -> Result<(), UploadError> {
    for part in parts {
        let Some(filename) = &part.filename else {
            let value = String::from_utf8_lossy(part.data).into_owned();
            vars.insert(part.name.clone(), value);
            continue;
        };
        if filename.is_empty() && part.data.is_empty() {
            // Empty file input
            continue;
        }
        if !valid_filename(filename) {
            tracing::warn!(filename = %filename, "Rejecting upload filename");
            return Err(UploadError::BadFilename);
        }
        if uploads.len() >= max_count {
            return Err(UploadError::TooMany);
        }
        if part.data.len() > max_size {
            return Err(UploadError::TooLarge);
        }
        let id = new_session_id().map_err(|_| UploadError::Io)?;
        let path = dir.join(format!("upload-{id}.tmp"));
        std::fs::write(&path, part.data).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Cannot save upload");
            UploadError::Io
        })?;
        tracing::debug!(field = %part.name, filename = %filename, size = part.data.len(), "Saved upload");
        uploads.push(Upload {
            name: part.name.clone(),
            client_filename: filename.clone(),
            content_type: part.content_type.clone(),
            path,
            size: part.data.len(),
        });
    }
    Ok(())
}

pub fn remove_uploads(uploads: &[Upload]) {
    for upload in uploads {
        if let Err(e) = std::fs::remove_file(&upload.path) {
            tracing::debug!(path = %upload.path.display(), error = %e, "Cannot remove upload");
        }
    }
}

use std::collections::HashMap;
use std::path::Path;

const DEFAULT_TYPE: &str = "application/octet-stream";

const TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("mjs", "application/javascript"),
    ("json", "application/json"),
    ("json5", "application/json"),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("csv", "text/csv"),
    ("xml", "application/xml"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("ico", "image/x-icon"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("wasm", "application/wasm"),
    ("mp4", "video/mp4"),
    ("mp3", "audio/mpeg"),
];

/// Extension to MIME type table, seeded with common types and extended by
/// `web.mime`.
#[derive(Debug, Clone)]
pub struct MimeTypes {
    types: HashMap<String, String>,
}

impl MimeTypes {
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let mut types: HashMap<String, String> = TYPES
            .iter()
            .map(|(ext, ty)| (ext.to_string(), ty.to_string()))
            .collect();
        for (ext, ty) in overrides {
            types.insert(ext.trim_start_matches('.').to_ascii_lowercase(), ty.clone());
        }
        Self { types }
    }

    pub fn lookup(&self, path: &Path) -> &str {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| self.types.get(&e.to_ascii_lowercase()))
            .map(String::as_str)
            .unwrap_or(DEFAULT_TYPE)
    }
}

impl Default for MimeTypes {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}

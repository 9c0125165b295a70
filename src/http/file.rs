//! Static document handler.
//!
//! Serves files below `web.documents`. The request path has already been
//! normalized, so it cannot climb out of the documents directory.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use crate::error::Result;
use crate::http::connection::Web;
use crate::http::request::Method;
use crate::http::response::StatusCode;
use crate::http::uri::encode_path;
use crate::http::writer::{http_date, parse_http_date};

/// Handles GET, HEAD, PUT and DELETE for a file route.
pub async fn serve(web: &mut Web) -> Result<()> {
    match web.request().method {
        Method::GET | Method::HEAD => get(web).await,
        Method::PUT => put(web).await,
        Method::DELETE => delete(web).await,
        _ => web.error(StatusCode::MethodNotAllowed, "Unsupported method").await,
    }
}

fn document_path(web: &Web) -> PathBuf {
    let path = web.request().path.trim_start_matches('/');
    web.host().config().documents.join(path)
}

async fn get(web: &mut Web) -> Result<()> {
    let mut path = document_path(web);
    let Ok(mut meta) = fs::metadata(&path) else {
        return web.error(StatusCode::NotFound, "Cannot find document").await;
    };

    if meta.is_dir() {
        if !web.request().path.ends_with('/') {
            let request = web.request();
            let mut location = format!("{}/", encode_path(&request.path));
            if !request.query.is_empty() {
                location.push('?');
                location.push_str(&request.query);
            }
            return web.redirect(StatusCode::MovedPermanently, &location).await;
        }
        path.push(&web.host().config().index);
        meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            _ => return web.error(StatusCode::NotFound, "Cannot find document").await,
        };
    }

    if let Ok(modified) = meta.modified() {
        let last_modified = http_date(modified);
        let since = web
            .request()
            .header("If-Modified-Since")
            .and_then(parse_http_date);
        // Compare at the one second resolution of HTTP dates
        if since.is_some_and(|since| parse_http_date(&last_modified).is_some_and(|m| m <= since)) {
            web.set_status(StatusCode::NotModified);
            web.set_header("Last-Modified", &last_modified)?;
            return web.finalize().await;
        }
        web.set_header("Last-Modified", &last_modified)?;
    }

    let mime = web.host().mime().lookup(&path).to_string();
    web.set_header("Content-Type", &mime)?;
    web.set_content_length(meta.len());

    if web.request().method == Method::HEAD {
        return web.finalize().await;
    }

    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Cannot open document");
            return web.error(StatusCode::NotFound, "Cannot find document").await;
        }
    };
    let mut block = vec![0u8; web.host().config().limits.buffer.clamp(1024, 64 * 1024)];
    loop {
        let n = file.read(&mut block)?;
        if n == 0 {
            break;
        }
        web.write(&block[..n]).await?;
    }
    web.finalize().await
}

async fn put(web: &mut Web) -> Result<()> {
    let path = document_path(web);
    if path.is_dir() {
        return web.error(StatusCode::BadRequest, "Cannot overwrite a directory").await;
    }
    let existed = path.exists();
    let mut file = match File::create(&path) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Cannot create document");
            let status = if e.kind() == ErrorKind::NotFound {
                StatusCode::NotFound
            } else {
                StatusCode::InternalServerError
            };
            return web.error(status, "Cannot write document").await;
        }
    };

    if web.route().is_some_and(|r| r.stream) {
        let mut block = Vec::new();
        loop {
            block.clear();
            if web.read(&mut block).await? == 0 {
                break;
            }
            file.write_all(&block)?;
        }
    } else {
        file.write_all(&web.request().body)?;
    }
    tracing::debug!(path = %path.display(), "Wrote document");

    web.set_status(if existed { StatusCode::NoContent } else { StatusCode::Created });
    web.finalize().await
}

async fn delete(web: &mut Web) -> Result<()> {
    let path = document_path(web);
    match fs::remove_file(&path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed document");
            web.set_status(StatusCode::NoContent);
            web.finalize().await
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            web.error(StatusCode::NotFound, "Cannot find document").await
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Cannot remove document");
            web.error(StatusCode::InternalServerError, "Cannot remove document").await
        }
    }
}

//! HTTP(S) fetch pipeline for EPG URL refresh.
//!
//! Fetches a remote EPG document, following up to five 302 redirects by
//! hand (client-side redirects are disabled so the hop budget is ours),
//! decides the payload kind from `Content-Type` with a URL-extension
//! fallback, gunzips `gz`/`bin` payloads, and hands the document to the
//! splitter. Also carries the log-file upload used by the get-log
//! command.

use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use tracing::info;

use super::splitter::{self, SplitError, SplitSummary};

const MAX_REDIRECT_HOPS: usize = 5;

#[derive(Debug)]
pub enum FetchError {
    InvalidUrl(String),
    /// Scheme is neither http nor https.
    UnsupportedScheme(String),
    Http(reqwest::Error),
    TooManyRedirects,
    /// Non-200, non-302 response.
    HttpStatus(u16),
    /// Neither Content-Type nor the URL filename yields an extension.
    UnknownContentType,
    /// Extension resolved but the payload kind is not handled.
    UnsupportedContentType(String),
    Gunzip(io::Error),
    Split(SplitError),
    Io(io::Error),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::InvalidUrl(url) => write!(f, "Invalid url: {}", url),
            FetchError::UnsupportedScheme(s) => write!(f, "Not supported protocol: {}", s),
            FetchError::Http(e) => write!(f, "Http error: {}", e),
            FetchError::TooManyRedirects => write!(f, "A lot of redirects"),
            FetchError::HttpStatus(code) => write!(f, "Wrong http response code: {}", code),
            FetchError::UnknownContentType => write!(f, "Unknown link content"),
            FetchError::UnsupportedContentType(ct) => {
                write!(f, "Not supported content type: {}", ct)
            }
            FetchError::Gunzip(e) => write!(f, "Gzip decode error: {}", e),
            FetchError::Split(e) => write!(f, "{}", e),
            FetchError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err)
    }
}

impl From<SplitError> for FetchError {
    fn from(err: SplitError) -> Self {
        FetchError::Split(err)
    }
}

/// Fetch `url` and split the document it yields into `out_dir`.
pub async fn refresh_from_url(url: &str, out_dir: &Path) -> Result<SplitSummary, FetchError> {
    info!(url, "Epg url refresh request");

    let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    let (body, content_type) = fetch_with_redirects(parsed.clone()).await?;

    let extension = effective_extension(content_type.as_deref(), &parsed);
    let extension = match extension {
        Some(ext) => ext,
        None => return Err(FetchError::UnknownContentType),
    };

    match extension.as_str() {
        "xml" => Ok(splitter::split_document(&body, out_dir)?),
        "gz" | "bin" => {
            let mut decoded = Vec::new();
            GzDecoder::new(&body[..])
                .read_to_end(&mut decoded)
                .map_err(FetchError::Gunzip)?;
            Ok(splitter::split_document(&decoded, out_dir)?)
        }
        _ => Err(FetchError::UnsupportedContentType(
            content_type.unwrap_or(extension),
        )),
    }
}

/// POST the local log file to `url`. Used by the get-log command.
pub async fn post_file(path: &Path, url: &str) -> Result<(), FetchError> {
    let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    check_scheme(&parsed)?;

    let body = tokio::fs::read(path).await.map_err(FetchError::Io)?;
    let client = reqwest::Client::builder().build()?;
    let resp = client.post(parsed).body(body).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus(status.as_u16()));
    }
    Ok(())
}

/// GET with manual 302 handling: five hops succeed, the sixth fails.
async fn fetch_with_redirects(mut url: Url) -> Result<(Vec<u8>, Option<String>), FetchError> {
    check_scheme(&url)?;
    let client = reqwest::Client::builder()
        .redirect(Policy::none())
        .build()?;

    let mut hops = 0usize;
    loop {
        let resp = client.get(url.clone()).send().await?;
        let status = resp.status();

        if status == StatusCode::FOUND {
            if let Some(location) = resp.headers().get(LOCATION).and_then(|v| v.to_str().ok()) {
                hops += 1;
                if hops > MAX_REDIRECT_HOPS {
                    return Err(FetchError::TooManyRedirects);
                }
                url = resp
                    .url()
                    .join(location)
                    .map_err(|_| FetchError::InvalidUrl(location.to_string()))?;
                check_scheme(&url)?;
                continue;
            }
        }
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(trim_content_type);
        let body = resp.bytes().await?;
        return Ok((body.to_vec(), content_type));
    }
}

fn check_scheme(url: &Url) -> Result<(), FetchError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(FetchError::UnsupportedScheme(other.to_string())),
    }
}

/// Strip any `;…` parameter suffix (`text/xml; charset=utf-8` →
/// `text/xml`).
fn trim_content_type(value: &str) -> String {
    match value.split_once(';') {
        Some((mime, _)) => mime.trim().to_ascii_lowercase(),
        None => value.trim().to_ascii_lowercase(),
    }
}

/// MIME→extension table first, URL filename extension as fallback.
/// A leading `*` (wildcard mappings like `*xml`) is tolerated.
fn effective_extension(content_type: Option<&str>, url: &Url) -> Option<String> {
    let from_mime = content_type.and_then(extension_for_mime);
    let ext = match from_mime {
        Some(ext) => ext.to_string(),
        None => url_filename_extension(url)?,
    };
    let ext = ext.trim_start_matches('*').to_ascii_lowercase();
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "text/xml" | "application/xml" => Some("xml"),
        "application/gzip" | "application/x-gzip" => Some("gz"),
        "application/octet-stream" => Some("bin"),
        "text/html" => Some("html"),
        "text/plain" => Some("txt"),
        _ => None,
    }
}

fn url_filename_extension(url: &Url) -> Option<String> {
    let name = url.path_segments()?.last()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_string())
    }
}

//! Media side-channel: inline image/video data is uploaded to the upstream
//! file endpoint before the chat request is rewritten to reference it.
//!
//! Accepts `data:` URIs and http(s) URLs. Downloads are verified against a
//! small magic-byte table; anything that is not a recognizable media file
//! is rejected rather than forwarded.

use super::UpstreamClient;
use crate::error::AppError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    fn from_content_type(content_type: &str) -> MediaKind {
        if content_type.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }
}

/// Upstream file-upload response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileUploadResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub meta: FileMeta,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub oss_endpoint: String,
    #[serde(default)]
    pub cdn_url: String,
}

/// File reference embedded in the translated chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamFile {
    #[serde(rename = "type")]
    pub kind: String,
    pub file: FileUploadResponse,
    pub id: String,
    pub url: String,
    pub name: String,
    pub status: String,
    pub size: i64,
    pub error: String,
    #[serde(rename = "itemId")]
    pub item_id: String,
    pub media: String,
}

const MIME_EXT: &[(&str, &str)] = &[
    ("image/png", ".png"),
    ("image/jpeg", ".jpg"),
    ("image/jpg", ".jpg"),
    ("image/gif", ".gif"),
    ("image/webp", ".webp"),
    ("image/bmp", ".bmp"),
    ("image/svg+xml", ".svg"),
    ("video/mp4", ".mp4"),
    ("video/webm", ".webm"),
    ("video/quicktime", ".mov"),
    ("video/x-msvideo", ".avi"),
    ("video/mpeg", ".mpeg"),
    ("video/x-matroska", ".mkv"),
];

fn ext_from_mime(content_type: &str, kind: MediaKind) -> &'static str {
    for (mime, ext) in MIME_EXT {
        if *mime == content_type {
            return ext;
        }
    }
    for (mime, ext) in MIME_EXT {
        let bare = mime
            .trim_start_matches("image/")
            .trim_start_matches("video/");
        if content_type.contains(bare) {
            return ext;
        }
    }
    match kind {
        MediaKind::Video => ".mp4",
        MediaKind::Image => ".png",
    }
}

/// Check the leading bytes against known media signatures.
fn is_valid_media_magic(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    // PNG
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return true;
    }
    // JPEG
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return true;
    }
    // GIF
    if data.starts_with(b"GIF8") {
        return true;
    }
    // WebP: RIFF....WEBP
    if data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        return true;
    }
    // BMP
    if data.starts_with(b"BM") {
        return true;
    }
    // MP4/MOV: ftyp at offset 4
    if &data[4..8] == b"ftyp" {
        return true;
    }
    // WebM / Matroska
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return true;
    }
    false
}

/// Split a data URL into payload bytes and its declared content type.
fn parse_data_url(data_url: &str) -> Result<(Vec<u8>, String), AppError> {
    let (header, payload) = data_url
        .split_once(',')
        .ok_or_else(|| AppError::BadRequest("malformed data url".to_string()))?;

    let content_type = header
        .split_once(':')
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.split(';').next())
        .unwrap_or("")
        .to_string();

    let data = STANDARD
        .decode(payload)
        .map_err(|e| AppError::BadRequest(format!("base64 decode failed: {}", e)))?;
    Ok((data, content_type))
}

/// Upstream-specific no-content links are short-circuited as a skip.
/// QQ multimedia download links with only an appid carry no file at all.
fn is_unsupported_media_url(url: &str) -> bool {
    if !url.contains("multimedia.nt.qq.com.cn/download") {
        return false;
    }
    match url.split_once('?') {
        Some((_, query)) => query.len() < 20 || !query.contains('&'),
        None => true,
    }
}

fn filename_from_url(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or("").to_string();
    if name.contains('.') && name.len() >= 3 {
        name
    } else {
        String::new()
    }
}

async fn download_from_url(
    client: &UpstreamClient,
    url: &str,
) -> Result<(Vec<u8>, String, String), AppError> {
    let mut request = client
        .http()
        .get(url)
        .header("User-Agent", "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36")
        .header("Accept", "image/*, video/*, */*")
        .timeout(DOWNLOAD_TIMEOUT);
    if url.contains("qq.com") {
        request = request.header("Referer", "https://qq.com/");
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(AppError::UpstreamStatus {
            status: response.status().as_u16(),
            body: String::new(),
        });
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let data = response.bytes().await?.to_vec();
    debug!("downloaded media: size={}, content_type={}", data.len(), content_type);

    if !is_valid_media_magic(&data) {
        error!(
            "downloaded payload failed magic-byte check, content_type={}, size={}",
            content_type,
            data.len()
        );
        return Err(AppError::BadRequest("not a recognizable media file".to_string()));
    }

    Ok((data, content_type, filename_from_url(url)))
}

async fn upload_to_upstream(
    client: &UpstreamClient,
    credential: &str,
    data: Vec<u8>,
    filename: String,
    content_type: String,
) -> Result<FileUploadResponse, AppError> {
    debug!(
        "uploading media: filename={}, content_type={}, size={}",
        filename,
        content_type,
        data.len()
    );

    let mime = if content_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        content_type
    };
    let part = reqwest::multipart::Part::bytes(data)
        .file_name(filename)
        .mime_str(&mime)
        .map_err(|e| AppError::BadRequest(format!("invalid content type: {}", e)))?;
    let form = reqwest::multipart::Form::new().part("file", part);

    let response = client
        .browser_headers(
            client
                .http()
                .post(format!("{}/api/v1/files/", client.base_url())),
            Some(credential),
        )
        .header("Accept", "*/*")
        .timeout(UPLOAD_TIMEOUT)
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<FileUploadResponse>()
        .await
        .map_err(|e| AppError::UpstreamTransport(format!("parse upload response: {}", e)))
}

/// Upload one media input (data URL or http(s) URL) and return the file
/// reference for the translated request. `Ok(None)` means the input was a
/// known no-content link and should be skipped silently.
pub async fn upload_media(
    client: &UpstreamClient,
    credential: &str,
    media_url: &str,
    mut kind: MediaKind,
) -> Result<Option<UpstreamFile>, AppError> {
    if is_unsupported_media_url(media_url) {
        debug!("skipping unsupported media url");
        return Ok(None);
    }

    let (data, mut content_type, mut filename) = if media_url.starts_with("data:") {
        let (data, content_type) = parse_data_url(media_url)?;
        (data, content_type, String::new())
    } else {
        download_from_url(client, media_url).await?
    };

    if content_type.is_empty() {
        content_type = match kind {
            MediaKind::Video => "video/mp4".to_string(),
            MediaKind::Image => "image/png".to_string(),
        };
    }
    // trust the content type over the caller's guess
    kind = MediaKind::from_content_type(&content_type);

    if filename.is_empty() {
        let ext = ext_from_mime(&content_type, kind);
        filename = if media_url.starts_with("data:") {
            let id = uuid::Uuid::new_v4().to_string();
            format!("{}{}", &id[..12], ext)
        } else {
            format!(
                "pasted_{}_{}{}",
                kind.as_str(),
                chrono::Utc::now().timestamp_millis(),
                ext
            )
        };
    }

    let uploaded = upload_to_upstream(client, credential, data, filename, content_type).await?;
    debug!("upload ok: id={}, cdn_url={}", uploaded.id, uploaded.meta.cdn_url);

    Ok(Some(UpstreamFile {
        kind: kind.as_str().to_string(),
        id: uploaded.id.clone(),
        url: format!("/api/v1/files/{}/content", uploaded.id),
        name: uploaded.filename.clone(),
        status: "uploaded".to_string(),
        size: uploaded.meta.size,
        error: String::new(),
        item_id: uuid::Uuid::new_v4().to_string(),
        media: kind.as_str().to_string(),
        file: uploaded,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_accept_known_formats() {
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
        assert!(is_valid_media_magic(&png));
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F', 0, 1];
        assert!(is_valid_media_magic(&jpeg));
        let mp4 = [0, 0, 0, 0x18, b'f', b't', b'y', b'p', b'm', b'p', b'4', b'2'];
        assert!(is_valid_media_magic(&mp4));
        let webm = [0x1A, 0x45, 0xDF, 0xA3, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(is_valid_media_magic(&webm));
    }

    #[test]
    fn magic_bytes_reject_text_and_short_input() {
        assert!(!is_valid_media_magic(b"<html><body>nope</body>"));
        assert!(!is_valid_media_magic(&[0x89, 0x50]));
    }

    #[test]
    fn data_url_parses_mime_and_payload() {
        // 1x1 PNG header bytes, enough for the mime path
        let url = "data:image/png;base64,iVBORw0KGgo=";
        let (data, content_type) = parse_data_url(url).unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(&data[..4], &[0x89, 0x50, 0x4E, 0x47]);
    }

    #[test]
    fn malformed_data_url_is_an_error() {
        assert!(parse_data_url("data:image/png;base64").is_err());
        assert!(parse_data_url("data:image/png;base64,!!!").is_err());
    }

    #[test]
    fn ext_lookup_prefers_exact_then_fuzzy() {
        assert_eq!(ext_from_mime("image/webp", MediaKind::Image), ".webp");
        assert_eq!(ext_from_mime("video/mp4; codecs=avc1", MediaKind::Video), ".mp4");
        assert_eq!(ext_from_mime("application/unknown", MediaKind::Video), ".mp4");
        assert_eq!(ext_from_mime("", MediaKind::Image), ".png");
    }

    #[test]
    fn qq_no_content_links_are_skipped() {
        assert!(is_unsupported_media_url(
            "https://multimedia.nt.qq.com.cn/download?appid=140"
        ));
        assert!(!is_unsupported_media_url(
            "https://multimedia.nt.qq.com.cn/download?appid=140&fileid=abcdef0123456789&spec=0"
        ));
        assert!(!is_unsupported_media_url("https://example.com/cat.png"));
    }

    #[test]
    fn filename_from_url_requires_extension() {
        assert_eq!(filename_from_url("https://x.com/a/cat.png?s=1"), "cat.png");
        assert_eq!(filename_from_url("https://x.com/download"), "");
    }
}

//! Content delivery: HTTP Range semantics over plain and encrypted files.
//!
//! This module maps a caller's Range request onto the storage layer. For
//! plaintext files that is a seek and a bounded read. For encrypted files the
//! requested *plaintext* window is translated into chunk coordinates and
//! served through [`StreamCipher::decrypt_range`], so a scrub through a
//! multi-gigabyte encrypted video touches only the covered chunks.
//!
//! The web layer consuming [`DeliveredContent`] owns the actual HTTP
//! response; this module decides status, headers, and the byte stream.

use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::pipe::plaintext_pipe;
use crate::stream::{plaintext_len, StreamCipher, StreamSalt};

/// Suffix marking a user-encrypted file on disk.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Buffered chunks in the decryption pipe before backpressure kicks in.
const PIPE_DEPTH: usize = 8;

/// How a caller wants an encrypted file served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Decrypt with the supplied password (default)
    #[default]
    Decrypt,
    /// Ship the ciphertext unmodified - diagnostic/export path, no password
    Raw,
}

impl DeliveryMode {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("raw") {
            DeliveryMode::Raw
        } else {
            DeliveryMode::Decrypt
        }
    }
}

/// Byte stream plus the response metadata the web layer needs.
pub struct DeliveredContent {
    /// 200 (full) or 206 (partial)
    pub status: u16,
    pub content_length: u64,
    pub content_type: String,
    /// `bytes <start>-<end>/<total>` when status is 206
    pub content_range: Option<String>,
    pub stream: ContentStream,
}

pub type ContentStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Serves file content out of a storage root.
pub struct ContentDelivery {
    root: PathBuf,
}

impl ContentDelivery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves `path`, applies Range semantics, and returns a stream.
    ///
    /// Routing: unencrypted files stream directly; encrypted files either
    /// stream raw ciphertext ([`DeliveryMode::Raw`]) or decrypt the requested
    /// plaintext window with the caller's password.
    pub async fn get_stream(
        &self,
        path: &str,
        range_header: Option<&str>,
        password: Option<&str>,
        mode: DeliveryMode,
    ) -> CoreResult<DeliveredContent> {
        let full = self.resolve(path)?;

        let meta = match fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Err(CoreError::IsADirectory(path.to_string()));
        }

        let filename = full
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path)
            .to_string();

        if self.is_encrypted(&full, &filename).await {
            match mode {
                DeliveryMode::Raw => self.raw_stream(&full, meta.len(), range_header).await,
                DeliveryMode::Decrypt => {
                    self.encrypted_stream(&full, &filename, meta.len(), range_header, password)
                        .await
                }
            }
        } else {
            self.plain_stream(&full, &filename, meta.len(), range_header).await
        }
    }

    fn resolve(&self, path: &str) -> CoreResult<PathBuf> {
        let rel = Path::new(path);
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(CoreError::storage(format!(
                        "path escapes storage root: {path}"
                    )))
                }
            }
        }
        Ok(self.root.join(rel))
    }

    /// Extension says encrypted, sidecar salt confirms it. A lone `.enc`
    /// suffix without a salt falls back to plain serving (fail open for
    /// availability), logged so the operator can investigate.
    async fn is_encrypted(&self, full: &Path, filename: &str) -> bool {
        if !filename.to_ascii_lowercase().ends_with(ENCRYPTED_SUFFIX) {
            return false;
        }
        if StreamSalt::sidecar_exists(full).await {
            true
        } else {
            warn!(
                file = %full.display(),
                "file has encrypted suffix but no salt sidecar, serving as plaintext"
            );
            false
        }
    }

    async fn plain_stream(
        &self,
        full: &Path,
        filename: &str,
        size: u64,
        range_header: Option<&str>,
    ) -> CoreResult<DeliveredContent> {
        let content_type = self.detect_content_type(full, filename).await;
        let mut file = fs::File::open(full).await?;

        if let Some(header) = range_header {
            let (start, end) = parse_range_header(header, size)?;
            file.seek(std::io::SeekFrom::Start(start)).await?;
            let length = end - start + 1;
            debug!(file = filename, start, end, "serving plaintext range");
            return Ok(DeliveredContent {
                status: 206,
                content_length: length,
                content_type,
                content_range: Some(format!("bytes {start}-{end}/{size}")),
                stream: Box::new(file.take(length)),
            });
        }

        Ok(DeliveredContent {
            status: 200,
            content_length: size,
            content_type,
            content_range: None,
            stream: Box::new(file),
        })
    }

    /// Ciphertext passthrough; range semantics apply to the ciphertext bytes.
    async fn raw_stream(
        &self,
        full: &Path,
        size: u64,
        range_header: Option<&str>,
    ) -> CoreResult<DeliveredContent> {
        let mut file = fs::File::open(full).await?;

        if let Some(header) = range_header {
            let (start, end) = parse_range_header(header, size)?;
            file.seek(std::io::SeekFrom::Start(start)).await?;
            let length = end - start + 1;
            return Ok(DeliveredContent {
                status: 206,
                content_length: length,
                content_type: "application/octet-stream".to_string(),
                content_range: Some(format!("bytes {start}-{end}/{size}")),
                stream: Box::new(file.take(length)),
            });
        }

        Ok(DeliveredContent {
            status: 200,
            content_length: size,
            content_type: "application/octet-stream".to_string(),
            content_range: None,
            stream: Box::new(file),
        })
    }

    async fn encrypted_stream(
        &self,
        full: &Path,
        filename: &str,
        ciphertext_size: u64,
        range_header: Option<&str>,
        password: Option<&str>,
    ) -> CoreResult<DeliveredContent> {
        let password = match password {
            Some(p) if !p.is_empty() => p,
            _ => return Err(CoreError::PasswordRequired),
        };

        let salt = StreamSalt::read_sidecar(full).await?;
        let cipher = StreamCipher::new(password, &salt)?;
        let plain_size = plaintext_len(ciphertext_size);

        // The served name and content type come from the original filename
        let display_name = filename
            .strip_suffix(ENCRYPTED_SUFFIX)
            .unwrap_or(filename)
            .to_string();
        let content_type = content_type_for_name(&display_name)
            .unwrap_or("application/octet-stream")
            .to_string();

        let mut file = fs::File::open(full).await?;
        let (mut writer, reader) = plaintext_pipe(PIPE_DEPTH);

        if let Some(header) = range_header {
            let (start, end) = parse_range_header(header, plain_size)?;
            let length = end - start + 1;
            debug!(file = filename, start, end, "serving decrypted range");

            tokio::spawn(async move {
                if let Err(e) = cipher.decrypt_range(&mut file, &mut writer, start, end).await {
                    warn!(error = %e, "range decryption failed mid-stream");
                    writer.abort(e.into_io()).await;
                }
            });

            return Ok(DeliveredContent {
                status: 206,
                content_length: length,
                content_type,
                content_range: Some(format!("bytes {start}-{end}/{plain_size}")),
                stream: Box::new(reader),
            });
        }

        tokio::spawn(async move {
            if let Err(e) = cipher.decrypt_stream(&mut file, &mut writer).await {
                warn!(error = %e, "full-stream decryption failed mid-stream");
                writer.abort(e.into_io()).await;
            }
        });

        Ok(DeliveredContent {
            status: 200,
            content_length: plain_size,
            content_type,
            content_range: None,
            stream: Box::new(reader),
        })
    }

    /// Extension lookup first; unknown extensions get a 512-byte sniff.
    async fn detect_content_type(&self, full: &Path, filename: &str) -> String {
        if let Some(ct) = content_type_for_name(filename) {
            return ct.to_string();
        }
        match sniff_file(full).await {
            Some(ct) => ct.to_string(),
            None => "application/octet-stream".to_string(),
        }
    }
}

/// Parses an HTTP Range header against a resource of `size` bytes.
///
/// Accepts `bytes=A-B` (inclusive, B clamped to size-1), `bytes=A-` (to end
/// of file), and `bytes=-N` (final N bytes). Syntax problems are
/// [`CoreError::MalformedRange`]; numerically valid but impossible windows
/// (start past EOF, start after end, suffix longer than the file) are
/// [`CoreError::RangeNotSatisfiable`] so the web layer can answer 416.
pub fn parse_range_header(header: &str, size: u64) -> CoreResult<(u64, u64)> {
    let malformed = || CoreError::MalformedRange(header.to_string());

    let ranges = header.strip_prefix("bytes=").ok_or_else(malformed)?;
    let (first, second) = ranges.split_once('-').ok_or_else(malformed)?;

    if first.is_empty() {
        // bytes=-N : final N bytes
        let suffix: u64 = second.parse().map_err(|_| malformed())?;
        if suffix == 0 || suffix > size {
            return Err(CoreError::RangeNotSatisfiable { size });
        }
        return Ok((size - suffix, size - 1));
    }

    let start: u64 = first.parse().map_err(|_| malformed())?;
    let end = if second.is_empty() {
        size.checked_sub(1).ok_or(CoreError::RangeNotSatisfiable { size })?
    } else {
        let raw_end: u64 = second.parse().map_err(|_| malformed())?;
        if raw_end < start {
            return Err(CoreError::RangeNotSatisfiable { size });
        }
        raw_end.min(size.saturating_sub(1))
    };

    if start >= size {
        return Err(CoreError::RangeNotSatisfiable { size });
    }
    Ok((start, end))
}

/// Fixed table for the formats a NAS serves constantly, then `mime_guess`.
fn content_type_for_name(filename: &str) -> Option<&'static str> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())?
        .to_ascii_lowercase();

    let known = match ext.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "html" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        _ => "",
    };
    if !known.is_empty() {
        return Some(known);
    }
    mime_guess::from_ext(&ext).first_raw()
}

/// Magic-number sniff over the first 512 bytes.
async fn sniff_file(path: &Path) -> Option<&'static str> {
    let mut file = fs::File::open(path).await.ok()?;
    let mut head = [0u8; 512];
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    sniff_bytes(&head[..filled])
}

fn sniff_bytes(head: &[u8]) -> Option<&'static str> {
    if head.is_empty() {
        return None;
    }
    let ct = if head.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        "image/png"
    } else if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if head.starts_with(b"GIF8") {
        "image/gif"
    } else if head.starts_with(b"%PDF") {
        "application/pdf"
    } else if head.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
        "application/zip"
    } else if head.starts_with(&[0x1F, 0x8B]) {
        "application/gzip"
    } else if head.len() >= 12 && &head[4..8] == b"ftyp" {
        "video/mp4"
    } else if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        "video/x-matroska"
    } else if head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WEBP" {
        "image/webp"
    } else if std::str::from_utf8(head).is_ok() {
        "text/plain; charset=utf-8"
    } else {
        return None;
    };
    Some(ct)
}

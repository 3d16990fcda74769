//! Content-addressed blob store ("Blossom"), served over HTTP (§6).
//!
//! The core never reads this directory; it is owned entirely by the HTTP
//! surface in [`crate::server`]. A blob's name on disk is its lowercase
//! SHA-256 hex digest, optionally suffixed with the extension it was
//! uploaded with (`<hash>.<ext>`), so a later `GET` can sniff a content
//! type even though the hash alone carries none.
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Metadata returned to the uploader and echoed back in `POST /upload`'s
/// JSON response body (§6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Blob {
    pub sha256: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
    pub url: String,
    pub uploaded: i64,
}

fn hex_of(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// `true` if `candidate` looks like the bare 64-hex-character form a blob
/// request path names (optionally with a trailing `.<ext>`, stripped by
/// the caller before this check runs).
pub fn is_hex_digest(candidate: &str) -> bool {
    candidate.len() == 64 && candidate.chars().all(|c| c.is_ascii_hexdigit())
}

/// Split a request path tail like `abcd...1234.png` into its hash and
/// optional extension.
pub fn split_hash_and_ext(path_tail: &str) -> Option<(&str, Option<&str>)> {
    match path_tail.split_once('.') {
        Some((hash, ext)) if is_hex_digest(hash) => Some((hash, Some(ext))),
        None if is_hex_digest(path_tail) => Some((path_tail, None)),
        _ => None,
    }
}

/// Find the on-disk file for `hash`, regardless of what extension (if
/// any) it was uploaded with. Returns `None` if no blob with this hash
/// has been stored.
pub fn locate(directory: &Path, hash: &str) -> Option<PathBuf> {
    let exact = directory.join(hash);
    if exact.is_file() {
        return Some(exact);
    }
    let entries = std::fs::read_dir(directory).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(hash) && (name.len() == hash.len() || name.as_bytes()[hash.len()] == b'.') {
            return Some(entry.path());
        }
    }
    None
}

/// Sniff a content type from file bytes, falling back to the stored
/// file's extension (if any) and finally to a generic octet stream.
pub fn content_type_for(path: &Path, bytes: &[u8]) -> String {
    let sniffed = infer_mime(bytes);
    if sniffed != "application/octet-stream" {
        return sniffed.to_owned();
    }
    mime_guess::from_path(path)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| sniffed.to_owned())
}

/// A small content-sniffing fallback for the handful of binary formats a
/// blossom store is most commonly asked to hold; anything else is served
/// as `application/octet-stream`.
fn infer_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'%', b'P', b'D', b'F', ..] => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Stream `body` to a temporary file inside `directory`, hash it, and
/// rename it into place as `<hash>[.<ext>]` (§6 `POST /upload`). Returns
/// an error if the body exceeds `max_bytes`.
pub async fn store(directory: &Path, body: &[u8], ext: Option<&str>, max_bytes: u64) -> Result<Blob> {
    if body.len() as u64 > max_bytes {
        return Err(Error::BadInput(format!(
            "upload of {} bytes exceeds the {max_bytes}-byte limit",
            body.len()
        )));
    }
    tokio::fs::create_dir_all(directory).await?;
    let tmp_path = directory.join(format!(".upload-{}", Uuid::new_v4()));
    {
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        tmp.write_all(body).await?;
        tmp.flush().await?;
    }

    let digest = Sha256::digest(body);
    let hash = hex_of(&digest);
    let content_type = content_type_for(Path::new(ext.unwrap_or("")), body);
    let file_name = match ext {
        Some(ext) if !ext.is_empty() => format!("{hash}.{ext}"),
        _ => hash.clone(),
    };
    let final_path = directory.join(&file_name);
    tokio::fs::rename(&tmp_path, &final_path).await?;

    Ok(Blob {
        sha256: hash.clone(),
        size: body.len() as u64,
        content_type,
        url: format!("/{file_name}"),
        uploaded: now_unix(),
    })
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

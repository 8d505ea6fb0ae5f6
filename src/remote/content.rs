//! Resolve the bytes of a remote file: inline base64 when the contents
//! endpoint returned it, otherwise a secondary blob fetch.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::{FileContent, RemoteRepository};
use crate::{
    config::RepoConfig,
    error::{Result, SyncError},
};

const BASE64: &str = "base64";
/// Marker the contents endpoint uses for files too large to inline.
const NONE: &str = "none";

/// Returns `Ok(None)` when the remote has no content to offer for the blob.
pub async fn resolve_file_bytes(
    remote: &dyn RemoteRepository,
    repo: &RepoConfig,
    file: &FileContent,
) -> Result<Option<Vec<u8>>> {
    match (&file.content, file.encoding.as_deref()) {
        (Some(_), Some(NONE)) | (None, _) => {}
        (Some(content), encoding) => {
            return decode_base64(&file.path, content, encoding).map(Some);
        }
    }

    tracing::debug!("fetching blob {} for {}", file.sha, file.path);
    let blob = remote.get_blob(repo, &file.sha).await?;
    match blob.content {
        Some(content) => decode_base64(&file.path, &content, blob.encoding.as_deref()).map(Some),
        None => Ok(None),
    }
}

/// Decode a base64 payload, ignoring the line breaks the API inserts.
/// Any encoding other than base64 is rejected rather than guessed at.
pub fn decode_base64(path: &str, content: &str, encoding: Option<&str>) -> Result<Vec<u8>> {
    if let Some(encoding) = encoding {
        if encoding != BASE64 {
            return Err(SyncError::UnsupportedEncoding {
                path: path.to_string(),
                encoding: encoding.to_string(),
            });
        }
    }
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(STANDARD.decode(compact)?)
}

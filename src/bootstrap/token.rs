use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix marking the structured `K10<ca-hash>::<username>:<password>` form.
pub const TOKEN_PREFIX: &str = "K10";
/// KV namespace holding encrypted bootstrap records.
pub const BOOTSTRAP_PREFIX: &str = "/bootstrap";
const SERVER_USERNAME: &str = "server";
const STORAGE_KEY_HASH_LEN: usize = 12;

/// Components of a parsed join token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenParts {
    pub ca_hash: Option<String>,
    pub username: String,
    pub password: String,
}

pub fn parse_token(token: &str) -> Result<TokenParts, TokenError> {
    let Some(rest) = token.strip_prefix(TOKEN_PREFIX) else {
        return Ok(TokenParts {
            ca_hash: None,
            username: SERVER_USERNAME.to_string(),
            password: token.to_string(),
        });
    };
    let parts: Vec<&str> = rest.split("::").collect();
    let [ca_hash, credentials] = parts.as_slice() else {
        return Err(TokenError::Malformed);
    };
    let (username, password) = credentials.split_once(':').ok_or(TokenError::Malformed)?;
    Ok(TokenParts {
        ca_hash: Some((*ca_hash).to_string()),
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Reduces a token to the secret used as encryption key input.
///
/// Idempotent for every token whose password does not itself start with
/// `K10`.
pub fn normalize_token(token: &str) -> Result<String, TokenError> {
    parse_token(token).map(|parts| parts.password)
}

/// Promotes a bare password to the full `K10<ca-hash>::server:<password>` form.
pub fn format_token(token: &str, ca_file: impl AsRef<Path>) -> Result<String, TokenError> {
    if token.is_empty() || token.starts_with(TOKEN_PREFIX) {
        return Ok(token.to_string());
    }
    let ca_file = ca_file.as_ref();
    let ca = fs::read(ca_file).map_err(|source| TokenError::CaRead {
        path: ca_file.to_path_buf(),
        source,
    })?;
    let ca_hash = hex::encode(Sha256::digest(&ca));
    Ok(format!(
        "{TOKEN_PREFIX}{ca_hash}::{SERVER_USERNAME}:{token}"
    ))
}

pub fn token_file_path(data_dir: impl AsRef<Path>) -> PathBuf {
    data_dir.as_ref().join("token")
}

/// Reads `<data_dir>/token`, falling back to the formatted server token when
/// the file has not been written yet.
pub fn read_token_file(
    data_dir: impl AsRef<Path>,
    server_token: &str,
    ca_file: impl AsRef<Path>,
) -> Result<String, TokenError> {
    let path = token_file_path(data_dir);
    match fs::read(&path) {
        Ok(bytes) => {
            let trimmed = trim_trailing_newlines(&bytes);
            String::from_utf8(trimmed.to_vec()).map_err(|_| TokenError::NotUtf8 { path })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => format_token(server_token, ca_file),
        Err(source) => Err(TokenError::TokenFileRead { path, source }),
    }
}

fn trim_trailing_newlines(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|byte| *byte != b'\n')
        .map(|idx| idx + 1)
        .unwrap_or(0);
    &bytes[..end]
}

/// Deterministic KV key for a normalized secret.
pub fn storage_key(secret: &str) -> String {
    format!("{BOOTSTRAP_PREFIX}/{}", key_hash(secret))
}

fn key_hash(secret: &str) -> String {
    let digest = hex::encode(Sha256::digest(secret.as_bytes()));
    digest[..STORAGE_KEY_HASH_LEN].to_string()
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error(
        "failed to normalize token; must be in format K10<CA-HASH>::<USERNAME>:<PASSWORD> or <PASSWORD>"
    )]
    Malformed,
    #[error("failed to read CA bundle {path:?} while formatting token: {source}")]
    CaRead { path: PathBuf, source: io::Error },
    #[error("failed to read token file {path:?}: {source}")]
    TokenFileRead { path: PathBuf, source: io::Error },
    #[error("token file {path:?} is not valid UTF-8")]
    NotUtf8 { path: PathBuf },
}

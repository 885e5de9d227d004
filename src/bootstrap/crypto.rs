//! Symmetric authenticated encryption of bootstrap bundles.
//!
//! Records are sealed with AES-256-GCM under a key stretched from the
//! normalized token with scrypt. The stored form is
//! `base64(salt) ":" base64(nonce || ciphertext || tag)`.

// aes-gcm relies on generic-array 0.14, so suppress the upstream deprecation locally.
#[allow(deprecated)]
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SALT_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// AES-256 key stretched from a bootstrap secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

pub fn derive_key(secret: &str, salt: &[u8]) -> Result<DerivedKey, CryptoError> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|_| CryptoError::KeyDerivation)?;
    let mut bytes = [0u8; KEY_LEN];
    scrypt::scrypt(secret.as_bytes(), salt, &params, &mut bytes)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(DerivedKey { bytes })
}

pub fn encrypt(secret: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(secret, &salt)?;
    let cipher = Aes256Gcm::new(key_ref(key.as_bytes()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(nonce_ref(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&sealed);
    let encoded = format!("{}:{}", STANDARD.encode(salt), STANDARD.encode(payload));
    Ok(encoded.into_bytes())
}

pub fn decrypt(secret: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let text = std::str::from_utf8(ciphertext).map_err(|_| CryptoError::MalformedCiphertext)?;
    let (salt, payload) = text
        .split_once(':')
        .ok_or(CryptoError::MalformedCiphertext)?;
    let salt = STANDARD
        .decode(salt)
        .map_err(|_| CryptoError::MalformedCiphertext)?;
    let payload = STANDARD
        .decode(payload)
        .map_err(|_| CryptoError::MalformedCiphertext)?;
    if payload.len() < NONCE_LEN {
        return Err(CryptoError::MalformedCiphertext);
    }
    let (nonce, sealed) = payload.split_at(NONCE_LEN);
    let key = derive_key(secret, &salt)?;
    let cipher = Aes256Gcm::new(key_ref(key.as_bytes()));
    cipher
        .decrypt(nonce_slice(nonce), sealed)
        .map_err(|_| CryptoError::Decryption)
}

#[allow(deprecated)]
fn key_ref(bytes: &[u8; KEY_LEN]) -> &Key<Aes256Gcm> {
    Key::<Aes256Gcm>::from_slice(bytes)
}

#[allow(deprecated)]
fn nonce_ref(bytes: &[u8; NONCE_LEN]) -> &GenericArray<u8, <Aes256Gcm as AeadCore>::NonceSize> {
    GenericArray::from_slice(bytes)
}

#[allow(deprecated)]
fn nonce_slice(bytes: &[u8]) -> &GenericArray<u8, <Aes256Gcm as AeadCore>::NonceSize> {
    GenericArray::from_slice(bytes)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key derivation failure")]
    KeyDerivation,
    #[error("encryption failure")]
    Encrypt,
    #[error("decryption failure: bootstrap data was sealed with a different token")]
    Decryption,
    #[error("malformed bootstrap ciphertext")]
    MalformedCiphertext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_recovers_plaintext() {
        for (secret, payload) in [("token", &b"{\"a\":1}"[..]), ("", &b""[..]), ("x", &[0u8; 300][..])] {
            let sealed = encrypt(secret, payload).unwrap();
            assert_eq!(decrypt(secret, &sealed).unwrap(), payload);
        }
    }

    #[test]
    fn wrong_secret_fails_authentication() {
        let sealed = encrypt("right", b"bundle").unwrap();
        assert_eq!(decrypt("wrong", &sealed), Err(CryptoError::Decryption));
        assert_eq!(decrypt("", &sealed), Err(CryptoError::Decryption));
    }

    #[test]
    fn encryption_is_salted() {
        let first = encrypt("token", b"bundle").unwrap();
        let second = encrypt("token", b"bundle").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_records_are_distinguished() {
        assert_eq!(
            decrypt("token", b"no-separator"),
            Err(CryptoError::MalformedCiphertext)
        );
        assert_eq!(
            decrypt("token", b"AAAA:AAAA"),
            Err(CryptoError::MalformedCiphertext)
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let mut sealed = encrypt("token", b"bundle").unwrap();
        let last = sealed.len() - 2;
        sealed[last] = if sealed[last] == b'A' { b'B' } else { b'A' };
        assert!(decrypt("token", &sealed).is_err());
    }
}

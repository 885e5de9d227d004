//! Cluster identity bootstrap: token handling, bundle (de)serialization, and
//! the encrypted record kept in the shared KV store.

pub mod bundle;
pub mod crypto;
pub mod store;
pub mod token;

pub use bundle::{
    decode_bundle, encode_bundle, read_from_disk, write_to_disk, Bundle, BundleError, BundleFile,
    BundleRoleMap, IoStage,
};
pub use crypto::{decrypt, derive_key, encrypt, CryptoError, DerivedKey};
pub use store::{BootstrapError, BootstrapStore, LoadOutcome};
pub use token::{
    format_token, normalize_token, parse_token, read_token_file, storage_key, token_file_path,
    TokenError, TokenParts, BOOTSTRAP_PREFIX, TOKEN_PREFIX,
};

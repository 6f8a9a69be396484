//! Credential derivation and digests shared by both tunnel protocols.
//!
//! The user id is derived from the admin secret and key with a double MD5,
//! then shaped like a v4 UUID. Trojan-style clients authenticate with the
//! SHA-224 hex digest of that same id.

use crate::{Error, Result};
use md5::{Digest as _, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::Sha224;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Admin secret used when none is configured
pub const DEFAULT_ADMIN_SECRET: &str = "cfspider-public";

/// Derivation key used when none is configured
pub const DEFAULT_KEY: &str = "cfspider-default-key";

/// Length of a Trojan password digest (SHA-224 hex)
pub const DIGEST_HEX_LEN: usize = 56;

static UUID_V4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("valid uuid regex")
});

/// Lowercase hex MD5
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// MD5(hex(MD5(secret ‖ key))[7..27]) as 32 lowercase hex chars.
pub fn derive_session_id(secret: &str, key: &str) -> String {
    let first = md5_hex(format!("{}{}", secret, key).as_bytes());
    md5_hex(first[7..27].as_bytes())
}

/// Shape a 32-char hex digest into the 8-4-4-4-12 user id.
///
/// The version and variant nibbles are forced to `4` and `8`, replacing
/// hex[12] and hex[16].
pub fn format_user_id(hex: &str) -> Result<String> {
    if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::parse(format!("Expected 32 hex chars, got {:?}", hex)));
    }
    let hex = hex.to_ascii_lowercase();
    Ok(format!(
        "{}-{}-4{}-8{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[13..16],
        &hex[17..20],
        &hex[20..32]
    ))
}

/// Hyphenated lowercase form of a raw 16-byte credential
pub fn format_identifier(bytes: &[u8; 16]) -> String {
    Uuid::from_bytes(*bytes).hyphenated().to_string()
}

/// SHA-224 of the password, 56 lowercase hex chars
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

/// Check the `xxxxxxxx-xxxx-4xxx-[89ab]xxx-xxxxxxxxxxxx` shape
pub fn is_valid_uuid_v4(s: &str) -> bool {
    UUID_V4.is_match(s)
}

/// Credentials accepted for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// VLESS identifier (hyphenated)
    pub user_id: String,
    /// Trojan password digest
    pub trojan_hash: String,
}

impl Credentials {
    /// Derive from secret and key. A valid v4 `uuid_override` wins and is
    /// lowercased; anything else is ignored.
    pub fn new(secret: &str, key: &str, uuid_override: Option<&str>) -> Result<Self> {
        let user_id = match uuid_override {
            Some(uuid) if is_valid_uuid_v4(uuid) => uuid.to_ascii_lowercase(),
            _ => format_user_id(&derive_session_id(secret, key))?,
        };
        Ok(Self::from_user_id(user_id))
    }

    pub fn from_user_id(user_id: String) -> Self {
        let trojan_hash = password_digest(&user_id);
        Credentials {
            user_id,
            trojan_hash,
        }
    }

    pub fn matches_user_id(&self, candidate: &str) -> bool {
        self.user_id.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    pub fn matches_trojan_hash(&self, candidate: &[u8]) -> bool {
        self.trojan_hash.as_bytes().ct_eq(candidate).into()
    }
}

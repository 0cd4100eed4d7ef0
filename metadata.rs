//! File metadata types shared with the external metadata store.
//!
//! The core never owns file rows itself; it consumes them through
//! [`FileMetadataProvider`], implemented by the surrounding appliance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// Encryption mode attached to each stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EncryptionMode {
    /// Stored as plaintext
    None,
    /// Encrypted under a user-supplied password (per-stream key)
    User,
    /// Encrypted under the vault DEK
    System,
}

impl EncryptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::None => "NONE",
            EncryptionMode::User => "USER",
            EncryptionMode::System => "SYSTEM",
        }
    }
}

/// User override for the encryption policy decision.
///
/// Parsed forgivingly: surrounding whitespace and case are ignored, and any
/// unrecognized value falls back to `Auto` so a stale client cannot force a
/// file out of policy by sending garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionOverride {
    #[default]
    Auto,
    ForceUser,
    ForceNone,
}

impl EncryptionOverride {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FORCE_USER" => EncryptionOverride::ForceUser,
            "FORCE_NONE" => EncryptionOverride::ForceNone,
            _ => EncryptionOverride::Auto,
        }
    }
}

/// Minimal file row the core needs from the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub filename: String,
    /// Path relative to the storage root
    pub storage_path: String,
    pub encryption: EncryptionMode,
}

/// Lookup interface implemented by the external file-metadata store.
#[async_trait]
pub trait FileMetadataProvider: Send + Sync {
    async fn get_file_by_id(&self, file_id: &str) -> CoreResult<FileRecord>;
    async fn get_file_by_path(&self, storage_path: &str) -> CoreResult<FileRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_parsing_is_forgiving() {
        assert_eq!(EncryptionOverride::parse("FORCE_USER"), EncryptionOverride::ForceUser);
        assert_eq!(EncryptionOverride::parse("  force_none "), EncryptionOverride::ForceNone);
        assert_eq!(EncryptionOverride::parse("AUTO"), EncryptionOverride::Auto);
        assert_eq!(EncryptionOverride::parse(""), EncryptionOverride::Auto);
        assert_eq!(EncryptionOverride::parse("bogus"), EncryptionOverride::Auto);
    }

    #[test]
    fn encryption_mode_serde_uses_uppercase() {
        let json = serde_json::to_string(&EncryptionMode::User).unwrap();
        assert_eq!(json, "\"USER\"");
        let back: EncryptionMode = serde_json::from_str("\"SYSTEM\"").unwrap();
        assert_eq!(back, EncryptionMode::System);
    }
}

//! Encryption policy: which mode a new file gets.
//!
//! Pure decision logic, no I/O. The user override always wins; in automatic
//! mode the size ceiling is checked before the extension policy so oversized
//! sensitive files degrade to plaintext rather than overwhelming constrained
//! hardware.

use std::path::Path;

use crate::metadata::{EncryptionMode, EncryptionOverride};

/// Default size ceiling for automatic encryption (500 MiB).
pub const DEFAULT_MAX_ENCRYPT_SIZE: u64 = 500 * 1024 * 1024;

// Extensions that get encrypted by default: document formats likely to hold
// personal data, key/certificate material, databases, and config files that
// tend to contain secrets.
const SENSITIVE_EXTENSIONS: &[&str] = &[
    // Office documents
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
    // Key and certificate material
    "key", "pem", "p12", "pfx", "crt", "cer",
    // Databases
    "db", "sqlite", "sql",
    // Config files
    "env", "config", "ini",
];

/// Policy engine with a configurable size ceiling.
#[derive(Debug, Clone)]
pub struct EncryptionPolicy {
    max_encrypt_size: u64,
}

impl Default for EncryptionPolicy {
    fn default() -> Self {
        Self {
            max_encrypt_size: DEFAULT_MAX_ENCRYPT_SIZE,
        }
    }
}

impl EncryptionPolicy {
    pub fn new(max_encrypt_size: u64) -> Self {
        Self { max_encrypt_size }
    }

    /// Decides the encryption mode for an incoming file.
    ///
    /// Precedence: `ForceUser` -> User; `ForceNone` -> None; otherwise the
    /// automatic rules: over the size ceiling -> None, sensitive extension
    /// -> User, everything else -> None.
    pub fn determine_mode(
        &self,
        filename: &str,
        size_bytes: u64,
        user_override: EncryptionOverride,
    ) -> EncryptionMode {
        match user_override {
            EncryptionOverride::ForceUser => return EncryptionMode::User,
            EncryptionOverride::ForceNone => return EncryptionMode::None,
            EncryptionOverride::Auto => {}
        }

        if size_bytes > self.max_encrypt_size {
            return EncryptionMode::None;
        }
        if self.is_sensitive_extension(filename) {
            return EncryptionMode::User;
        }
        EncryptionMode::None
    }

    pub fn is_sensitive_extension(&self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let ext = e.to_ascii_lowercase();
                SENSITIVE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
    }

    pub fn max_encrypt_size(&self) -> u64 {
        self.max_encrypt_size
    }
}

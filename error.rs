use thiserror::Error;

/// Error taxonomy for the encrypted-storage core.
///
/// Variants are grouped by concern: vault configuration and lock state,
/// authentication, access policy, transport/format, and ciphertext integrity.
/// Anything touching key material fails closed - an ambiguous crypto failure
/// is never reported as partial success.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Vault directory has no config - `setup` has never run
    #[error("vault is not configured")]
    NotConfigured,

    /// `setup` called against an existing vault
    #[error("vault is already configured")]
    AlreadyConfigured,

    /// Uniform authentication failure. Deliberately does not distinguish
    /// wrong-password from corrupted key material (oracle avoidance).
    #[error("invalid master password")]
    InvalidPassword,

    /// Operation needs the DEK but the vault is locked
    #[error("vault is locked")]
    VaultLocked,

    #[error("vault is already locked")]
    AlreadyLocked,

    #[error("vault is already unlocked")]
    AlreadyUnlocked,

    /// Too many consecutive failed unlock attempts
    #[error("unlock temporarily blocked after repeated failures")]
    UnlockThrottled,

    /// Blind-agent rule: user-encrypted content never reaches the indexer.
    /// Callers treat this as "skip", not "retry".
    #[error("content is encrypted and cannot be indexed")]
    ContentProtected,

    /// Ephemeral access to user-encrypted content needs a password
    #[error("password required for encrypted content access")]
    PasswordRequired,

    /// Vault-DEK-backed ephemeral access is a declared stub
    #[error("system-mode ephemeral access is not implemented")]
    SystemModeUnsupported,

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("cannot stream a directory: {0}")]
    IsADirectory(String),

    /// Range header failed to parse (syntax)
    #[error("malformed range header: {0}")]
    MalformedRange(String),

    /// Range parsed but lies outside the resource; carries the total size so
    /// the web layer can render `Content-Range: bytes */{size}` with a 416
    #[error("range not satisfiable for resource of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    /// Authentication-tag verification failed on a chunk. Always fatal to
    /// that chunk; never downgraded.
    #[error("ciphertext failed authentication")]
    Integrity,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("cipher failure: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("indexing agent error: {0}")]
    Agent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    /// Converts into an `std::io::Error` for surfaces that speak I/O, such as
    /// the read side of an in-memory pipe.
    pub fn into_io(self) -> std::io::Error {
        match self {
            CoreError::Io(e) => e,
            CoreError::Integrity => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, CoreError::Integrity)
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}

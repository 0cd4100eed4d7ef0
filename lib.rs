//! # naslock - Encrypted Storage Core for a Personal NAS
//!
//! naslock is the security core of a personal NAS appliance: it protects
//! files at rest with AES-256-GCM, serves them efficiently over HTTP Range
//! semantics without decrypting whole files into memory, detects access to
//! decoy files and revokes all key material in response, and guarantees that
//! an AI indexing pipeline never observes protected plaintext outside an
//! explicit, ephemeral user query.
//!
//! ## Subsystems
//!
//! - **Vault** ([`vault`]): master-password key hierarchy with a strict
//!   lock/unlock lifecycle and multi-pass key erasure
//! - **Stream cipher** ([`stream`]): 64 KiB chunked AEAD with random-access
//!   partial decryption
//! - **Policy** ([`policy`]): pure decision logic for per-file encryption
//! - **Content delivery** ([`delivery`]): HTTP Range requests mapped onto
//!   chunk boundaries
//! - **Honeyfiles** ([`honeyfile`]): decoy files wired to the vault kill
//!   switch
//! - **Blind agent** ([`feeder`]): the boundary keeping encrypted content
//!   out of the AI index
//!
//! ## Quick Start
//!
//! ```no_run
//! use naslock::vault::Vault;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let vault = Vault::new("./vault");
//!     vault.setup("master password").await?;
//!
//!     let wrapped = vault.encrypt_data(b"wifi credentials").await?;
//!     let plain = vault.decrypt_data(&wrapped).await?;
//!     assert_eq!(plain, b"wifi credentials");
//!
//!     vault.lock().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Cipher Stream Format
//!
//! Encrypted files are a plain sequence of chunks, each
//! `[nonce:12][ciphertext][tag:16]` with 64 KiB of plaintext per chunk
//! (final chunk may be shorter). No container header: the ciphertext offset
//! of chunk N is `N * 65564`, so range requests seek straight to the data.

pub mod config;
pub mod delivery;
pub mod error;
pub mod feeder;
pub mod honeyfile;
pub mod metadata;
pub mod pipe;
pub mod policy;
pub mod stream;
pub mod vault;

// Re-export common types for convenience
pub use error::{CoreError, CoreResult};

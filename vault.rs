//! Master-password vault: key hierarchy, lock lifecycle, secure erasure.
//!
//! The vault owns a random 32-byte Data Encryption Key (DEK). The DEK is
//! wrapped with AES-256-GCM under a Key Encryption Key (KEK) derived from the
//! master password via Argon2id, and only the wrapped form ever touches disk.
//!
//! ## Persisted Layout
//!
//! ```text
//! <vault_dir>/config.json         {"algorithm","keyDerivation","version"}
//! <vault_dir>/salt.bin            32 raw bytes
//! <vault_dir>/encrypted_dek.bin   [nonce:12][ciphertext][tag:16]
//! ```
//!
//! Invariant: the plaintext DEK exists in memory if and only if the vault is
//! unlocked. `lock()` overwrites the buffer (0xFF pass, 0x00 pass) before
//! releasing it, and the honeyfile kill switch reaches the vault only through
//! `lock()` - never through internals.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{compiler_fence, Ordering};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use zeroize::Zeroize;

use crate::error::{CoreError, CoreResult};

/// DEK / KEK length (AES-256)
pub const DEK_SIZE: usize = 32;

/// Vault KDF salt length
pub const VAULT_SALT_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;

pub const CONFIG_FILE: &str = "config.json";
pub const SALT_FILE: &str = "salt.bin";
pub const DEK_FILE: &str = "encrypted_dek.bin";

// Argon2id parameters for the vault KDF. Memory-hard enough to resist
// offline brute force while staying inside constrained appliance hardware.
const ARGON_MEMORY_KIB: u32 = 64 * 1024;
const ARGON_ITERATIONS: u32 = 3;
const ARGON_PARALLELISM: u32 = 4;

// Unlock throttling: after this many consecutive failures, refuse attempts
// for the lockout window. The counter resets on success.
const MAX_FAILED_UNLOCKS: u32 = 5;
const UNLOCK_LOCKOUT: Duration = Duration::from_secs(5 * 60);

/// Vault metadata persisted as `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub algorithm: String,
    #[serde(rename = "keyDerivation")]
    pub key_derivation: String,
    pub version: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            algorithm: "aes-256-gcm".to_string(),
            key_derivation: "argon2id".to_string(),
            version: 1,
        }
    }
}

/// Snapshot of the vault for status endpoints and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub configured: bool,
    pub locked: bool,
    pub vault_dir: String,
    pub algorithm: String,
    pub kdf: String,
    pub version: u32,
}

/// A file handed out for backup export.
#[derive(Debug, Clone)]
pub struct VaultBackupFile {
    pub filename: String,
    pub content: Vec<u8>,
}

struct VaultState {
    /// Present iff unlocked
    dek: Option<[u8; DEK_SIZE]>,
    failed_unlocks: u32,
    lockout_until: Option<Instant>,
}

impl VaultState {
    /// 0xFF pass, 0x00 pass, then zeroize - defeats naive forensic recovery
    /// of recently freed memory.
    fn wipe_dek(&mut self) {
        if let Some(dek) = self.dek.as_mut() {
            for b in dek.iter_mut() {
                *b = 0xFF;
            }
            compiler_fence(Ordering::SeqCst);
            for b in dek.iter_mut() {
                *b = 0x00;
            }
            compiler_fence(Ordering::SeqCst);
            dek.zeroize();
        }
        self.dek = None;
    }
}

impl Drop for VaultState {
    fn drop(&mut self) {
        self.wipe_dek();
    }
}

/// The vault. One per appliance; share via `Arc`.
///
/// Lock discipline: `encrypt_data`/`decrypt_data`/status queries take a
/// shared read guard on the state; `setup`/`unlock`/`lock` take the
/// exclusive write guard. `lock()` therefore blocks until in-flight readers
/// drain, and no reader can observe a partially wiped key.
pub struct Vault {
    dir: PathBuf,
    state: RwLock<VaultState>,
}

impl Vault {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: RwLock::new(VaultState {
                dek: None,
                failed_unlocks: 0,
                lockout_until: None,
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn is_configured(&self) -> bool {
        fs::try_exists(self.dir.join(CONFIG_FILE)).await.unwrap_or(false)
    }

    pub async fn is_unlocked(&self) -> bool {
        self.state.read().await.dek.is_some()
    }

    /// Initializes the vault with a master password and transitions to
    /// Unlocked. Fails with [`CoreError::AlreadyConfigured`] if a vault
    /// already exists; reconfiguration requires deleting the vault directory
    /// out-of-band.
    ///
    /// The three vault files are staged under temporary names and renamed
    /// into place; any failure rolls the directory back so no partial vault
    /// remains.
    pub async fn setup(&self, password: &str) -> CoreResult<()> {
        let mut state = self.state.write().await;

        if self.is_configured().await {
            return Err(CoreError::AlreadyConfigured);
        }

        fs::create_dir_all(&self.dir).await?;
        restrict_permissions(&self.dir, 0o700).await;

        let mut salt = [0u8; VAULT_SALT_SIZE];
        OsRng.fill_bytes(&mut salt);

        let mut dek = [0u8; DEK_SIZE];
        OsRng.fill_bytes(&mut dek);

        let mut kek = derive_kek(password, &salt)?;
        let wrapped = seal(&kek, &dek)?;
        kek.zeroize();

        let config = serde_json::to_vec_pretty(&VaultConfig::default())
            .map_err(|e| CoreError::storage(e.to_string()))?;

        if let Err(e) = self
            .persist_atomically(&[
                (SALT_FILE, salt.as_slice()),
                (DEK_FILE, wrapped.as_slice()),
                (CONFIG_FILE, config.as_slice()),
            ])
            .await
        {
            error!(error = %e, "vault setup failed, rolling back partial state");
            self.remove_vault_files().await;
            return Err(e);
        }

        state.dek = Some(dek);
        info!(vault_dir = %self.dir.display(), "vault configured and unlocked");
        Ok(())
    }

    /// Unwraps the DEK with the given password: Locked -> Unlocked.
    ///
    /// Every unwrap failure - bad tag, truncated file - is reported as
    /// [`CoreError::InvalidPassword`]; distinguishing causes would leak an
    /// oracle.
    pub async fn unlock(&self, password: &str) -> CoreResult<()> {
        let mut state = self.state.write().await;

        if let Some(until) = state.lockout_until {
            if Instant::now() < until {
                warn!(
                    failed_attempts = state.failed_unlocks,
                    "unlock refused during lockout window"
                );
                return Err(CoreError::UnlockThrottled);
            }
            state.lockout_until = None;
        }

        if !self.is_configured().await {
            return Err(CoreError::NotConfigured);
        }
        if state.dek.is_some() {
            return Err(CoreError::AlreadyUnlocked);
        }

        let salt = fs::read(self.dir.join(SALT_FILE)).await?;
        let wrapped = fs::read(self.dir.join(DEK_FILE)).await?;

        let mut kek = derive_kek(password, &salt)?;
        let unwrapped = open(&kek, &wrapped);
        kek.zeroize();

        let dek_bytes = match unwrapped {
            Ok(p) if p.len() == DEK_SIZE => p,
            _ => {
                state.failed_unlocks += 1;
                warn!(attempt = state.failed_unlocks, "vault unlock failed");
                if state.failed_unlocks >= MAX_FAILED_UNLOCKS {
                    state.lockout_until = Some(Instant::now() + UNLOCK_LOCKOUT);
                    error!(
                        lockout_secs = UNLOCK_LOCKOUT.as_secs(),
                        "unlock disabled after repeated failures"
                    );
                }
                return Err(CoreError::InvalidPassword);
            }
        };

        let mut dek_bytes = dek_bytes;
        let mut dek = [0u8; DEK_SIZE];
        dek.copy_from_slice(&dek_bytes);
        dek_bytes.zeroize();
        state.failed_unlocks = 0;
        state.dek = Some(dek);

        info!("vault unlocked");
        Ok(())
    }

    /// Wipes the DEK and transitions to Locked.
    ///
    /// Blocks until in-flight `encrypt_data`/`decrypt_data` calls release
    /// their read guards; no new operation can begin once the write guard is
    /// queued. This is the kill-switch entry point.
    pub async fn lock(&self) -> CoreResult<()> {
        let mut state = self.state.write().await;
        if state.dek.is_none() {
            return Err(CoreError::AlreadyLocked);
        }
        state.wipe_dek();
        info!("vault locked, key material wiped");
        Ok(())
    }

    /// Whole-buffer AES-256-GCM under the live DEK. For small artifacts;
    /// large files go through the stream cipher.
    pub async fn encrypt_data(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let state = self.state.read().await;
        let dek = state.dek.as_ref().ok_or(CoreError::VaultLocked)?;
        seal(dek, plaintext)
    }

    pub async fn decrypt_data(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        let state = self.state.read().await;
        let dek = state.dek.as_ref().ok_or(CoreError::VaultLocked)?;
        open(dek, ciphertext).map_err(|_| CoreError::Integrity)
    }

    pub async fn status(&self) -> VaultStatus {
        let configured = self.is_configured().await;
        let config = if configured {
            self.read_config().await.unwrap_or_default()
        } else {
            VaultConfig::default()
        };
        VaultStatus {
            configured,
            locked: !self.is_unlocked().await,
            vault_dir: self.dir.display().to_string(),
            algorithm: config.algorithm,
            kdf: config.key_derivation,
            version: config.version,
        }
    }

    /// Files safe to include in a backup export: `salt.bin` and
    /// `config.json` only. The wrapped DEK is deliberately excluded so a
    /// backup alone can never be recovered without the password.
    pub async fn backup_files(&self) -> CoreResult<Vec<VaultBackupFile>> {
        if !self.is_configured().await {
            return Err(CoreError::NotConfigured);
        }
        let mut files = Vec::with_capacity(2);
        for name in [SALT_FILE, CONFIG_FILE] {
            files.push(VaultBackupFile {
                filename: name.to_string(),
                content: fs::read(self.dir.join(name)).await?,
            });
        }
        Ok(files)
    }

    async fn read_config(&self) -> CoreResult<VaultConfig> {
        let data = fs::read(self.dir.join(CONFIG_FILE)).await?;
        serde_json::from_slice(&data).map_err(|e| CoreError::storage(e.to_string()))
    }

    async fn persist_atomically(&self, files: &[(&str, &[u8])]) -> CoreResult<()> {
        // Stage everything first so a failed write never leaves a final file
        for (name, content) in files {
            let tmp = self.dir.join(format!("{name}.tmp"));
            fs::write(&tmp, content).await?;
            restrict_permissions(&tmp, 0o600).await;
        }
        for (name, _) in files {
            fs::rename(self.dir.join(format!("{name}.tmp")), self.dir.join(name)).await?;
        }
        Ok(())
    }

    async fn remove_vault_files(&self) {
        for name in [SALT_FILE, DEK_FILE, CONFIG_FILE] {
            let _ = fs::remove_file(self.dir.join(name)).await;
            let _ = fs::remove_file(self.dir.join(format!("{name}.tmp"))).await;
        }
    }
}

fn derive_kek(password: &str, salt: &[u8]) -> CoreResult<[u8; DEK_SIZE]> {
    let params = Params::new(
        ARGON_MEMORY_KIB,
        ARGON_ITERATIONS,
        ARGON_PARALLELISM,
        Some(DEK_SIZE),
    )
    .map_err(|e| CoreError::KeyDerivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut kek = [0u8; DEK_SIZE];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut kek)
        .map_err(|e| CoreError::KeyDerivation(e.to_string()))?;
    Ok(kek)
}

/// AES-256-GCM with the random nonce prepended to the ciphertext.
fn seal(key: &[u8; DEK_SIZE], plaintext: &[u8]) -> CoreResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("BUG: key is always 32 bytes");
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CoreError::Crypto("encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; DEK_SIZE], data: &[u8]) -> Result<Vec<u8>, ()> {
    if data.len() < NONCE_SIZE {
        return Err(());
    }
    let cipher = Aes256Gcm::new_from_slice(key).expect("BUG: key is always 32 bytes");
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|_| ())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
        warn!(path = %path.display(), error = %e, "failed to restrict permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fresh_vault() -> (TempDir, Vault) {
        let tmp = TempDir::new().unwrap();
        let vault = Vault::new(tmp.path().join("vault"));
        (tmp, vault)
    }

    #[tokio::test]
    async fn setup_unlock_lock_lifecycle() {
        let (_tmp, vault) = fresh_vault().await;

        assert!(!vault.is_configured().await);
        vault.setup("hunter2hunter2").await.unwrap();
        assert!(vault.is_configured().await);
        assert!(vault.is_unlocked().await);

        // Setup is one-shot
        assert!(matches!(
            vault.setup("other").await,
            Err(CoreError::AlreadyConfigured)
        ));

        vault.lock().await.unwrap();
        assert!(!vault.is_unlocked().await);
        assert!(matches!(vault.lock().await, Err(CoreError::AlreadyLocked)));

        vault.unlock("hunter2hunter2").await.unwrap();
        assert!(vault.is_unlocked().await);
        assert!(matches!(
            vault.unlock("hunter2hunter2").await,
            Err(CoreError::AlreadyUnlocked)
        ));
    }

    #[tokio::test]
    async fn wrong_password_never_changes_state() {
        let (_tmp, vault) = fresh_vault().await;
        vault.setup("the real password").await.unwrap();
        vault.lock().await.unwrap();

        for _ in 0..3 {
            assert!(matches!(
                vault.unlock("guess").await,
                Err(CoreError::InvalidPassword)
            ));
            assert!(!vault.is_unlocked().await);
        }

        vault.unlock("the real password").await.unwrap();
        assert!(vault.is_unlocked().await);
    }

    #[tokio::test]
    async fn unlock_throttles_after_repeated_failures() {
        let (_tmp, vault) = fresh_vault().await;
        vault.setup("pw").await.unwrap();
        vault.lock().await.unwrap();

        for _ in 0..MAX_FAILED_UNLOCKS {
            assert!(matches!(
                vault.unlock("nope").await,
                Err(CoreError::InvalidPassword)
            ));
        }
        // The right password is also refused while throttled
        assert!(matches!(
            vault.unlock("pw").await,
            Err(CoreError::UnlockThrottled)
        ));
    }

    #[tokio::test]
    async fn data_ops_require_unlocked_vault() {
        let (_tmp, vault) = fresh_vault().await;
        vault.setup("pw").await.unwrap();

        let secret = b"wifi credentials";
        let wrapped = vault.encrypt_data(secret).await.unwrap();
        assert_ne!(&wrapped[NONCE_SIZE..], secret.as_slice());
        assert_eq!(vault.decrypt_data(&wrapped).await.unwrap(), secret);

        vault.lock().await.unwrap();
        assert!(matches!(
            vault.encrypt_data(secret).await,
            Err(CoreError::VaultLocked)
        ));
        assert!(matches!(
            vault.decrypt_data(&wrapped).await,
            Err(CoreError::VaultLocked)
        ));

        vault.unlock("pw").await.unwrap();
        assert_eq!(vault.decrypt_data(&wrapped).await.unwrap(), secret);
    }

    #[tokio::test]
    async fn tampered_wrapped_data_is_an_integrity_error() {
        let (_tmp, vault) = fresh_vault().await;
        vault.setup("pw").await.unwrap();

        let mut wrapped = vault.encrypt_data(b"payload").await.unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;
        assert!(matches!(
            vault.decrypt_data(&wrapped).await,
            Err(CoreError::Integrity)
        ));
    }

    #[tokio::test]
    async fn backup_export_never_contains_wrapped_dek() {
        let (_tmp, vault) = fresh_vault().await;
        vault.setup("pw").await.unwrap();

        let files = vault.backup_files().await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
        assert!(names.contains(&SALT_FILE));
        assert!(names.contains(&CONFIG_FILE));
        assert!(!names.contains(&DEK_FILE));

        let salt = files.iter().find(|f| f.filename == SALT_FILE).unwrap();
        assert_eq!(salt.content.len(), VAULT_SALT_SIZE);
    }

    #[tokio::test]
    async fn unlock_without_setup_reports_not_configured() {
        let (_tmp, vault) = fresh_vault().await;
        assert!(matches!(
            vault.unlock("pw").await,
            Err(CoreError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn persisted_layout_matches_contract() {
        let (_tmp, vault) = fresh_vault().await;
        vault.setup("pw").await.unwrap();

        let salt = std::fs::read(vault.dir().join(SALT_FILE)).unwrap();
        assert_eq!(salt.len(), VAULT_SALT_SIZE);

        let wrapped = std::fs::read(vault.dir().join(DEK_FILE)).unwrap();
        // nonce + DEK ciphertext + tag
        assert_eq!(wrapped.len(), NONCE_SIZE + DEK_SIZE + 16);

        let config: VaultConfig =
            serde_json::from_slice(&std::fs::read(vault.dir().join(CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(config.algorithm, "aes-256-gcm");
        assert_eq!(config.key_derivation, "argon2id");
        assert_eq!(config.version, 1);
    }
}

//! Blind Agent Protocol: the boundary between storage and the AI indexer.
//!
//! The indexing agent is blind to user-encrypted content. During automated
//! background indexing, encrypted files simply do not exist - requests for
//! them fail with [`CoreError::ContentProtected`] and the caller skips them,
//! so protected plaintext can never land in the vector store.
//!
//! The single exception is an explicit, live user query: with the user's
//! password, [`BlindAgentFeeder::ephemeral_content`] decrypts through an
//! in-memory pipe. The plaintext exists only in the pipe's RAM buffers while
//! the caller reads; it is never persisted and never indexed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::metadata::{EncryptionMode, FileMetadataProvider};
use crate::pipe::plaintext_pipe;
use crate::stream::{StreamCipher, StreamSalt};
use crate::vault::Vault;

/// Buffered chunks in the ephemeral pipe.
const PIPE_DEPTH: usize = 8;

/// Ingest request for the indexing agent's `process` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPayload {
    pub content: String,
    pub file_id: String,
    pub file_path: String,
    pub mime_type: String,
}

/// Request/response interface of the external indexing service.
#[async_trait]
pub trait IndexAgent: Send + Sync {
    async fn process(&self, payload: IngestPayload) -> CoreResult<()>;
    async fn delete(&self, file_id: &str) -> CoreResult<()>;
    /// All file IDs currently present in the vector store
    async fn list_vectors(&self) -> CoreResult<Vec<String>>;
}

/// Content stream handed to the indexing caller.
pub type FeederStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Gatekeeper for everything the indexing agent may read.
pub struct BlindAgentFeeder {
    provider: Arc<dyn FileMetadataProvider>,
    agent: Arc<dyn IndexAgent>,
    vault: Arc<Vault>,
    storage_root: PathBuf,
}

impl BlindAgentFeeder {
    pub fn new(
        provider: Arc<dyn FileMetadataProvider>,
        agent: Arc<dyn IndexAgent>,
        vault: Arc<Vault>,
        storage_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            agent,
            vault,
            storage_root: storage_root.into(),
        }
    }

    /// Opens file content for background indexing.
    ///
    /// User-encrypted files unconditionally fail with
    /// [`CoreError::ContentProtected`]; the indexing job treats that as
    /// "skip", never "retry". Everything else streams directly.
    pub async fn content_for_indexing(&self, file_id: &str) -> CoreResult<FeederStream> {
        let record = match self.provider.get_file_by_id(file_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(file_id, error = %e, "file metadata lookup failed");
                return Err(CoreError::NotFound(file_id.to_string()));
            }
        };

        if record.encryption == EncryptionMode::User {
            warn!(
                file_id,
                filename = %record.filename,
                "blocked: user-encrypted file cannot be indexed"
            );
            return Err(CoreError::ContentProtected);
        }

        let full = self.storage_root.join(&record.storage_path);
        let file = fs::File::open(&full).await?;
        debug!(file_id, filename = %record.filename, "file approved for indexing");
        Ok(Box::new(file))
    }

    /// Path-based variant for callers that only know the storage path.
    pub async fn content_for_indexing_by_path(&self, storage_path: &str) -> CoreResult<FeederStream> {
        let record = self
            .provider
            .get_file_by_path(storage_path)
            .await
            .map_err(|_| CoreError::NotFound(storage_path.to_string()))?;
        self.content_for_indexing(&record.id).await
    }

    /// Opens file content for a live, interactive query.
    ///
    /// Routing by encryption mode: `None` streams directly; `User` requires
    /// a non-empty password and decrypts through a RAM-only pipe - the
    /// producer task feeds plaintext into the write end while the caller
    /// drains the read end, and a decryption failure surfaces as a read
    /// error rather than a hang. `System` is a declared stub: it reports
    /// [`CoreError::SystemModeUnsupported`] instead of guessing at an
    /// insecure fallback.
    pub async fn ephemeral_content(
        &self,
        file_id: &str,
        user_password: &str,
    ) -> CoreResult<FeederStream> {
        let record = self
            .provider
            .get_file_by_id(file_id)
            .await
            .map_err(|_| CoreError::NotFound(file_id.to_string()))?;

        let full = self.storage_root.join(&record.storage_path);

        match record.encryption {
            EncryptionMode::None => {
                let file = fs::File::open(&full).await?;
                Ok(Box::new(file))
            }
            EncryptionMode::User => {
                if user_password.is_empty() {
                    warn!(file_id, filename = %record.filename, "ephemeral access denied, password required");
                    return Err(CoreError::PasswordRequired);
                }

                let salt = StreamSalt::read_sidecar(&full).await?;
                let cipher = StreamCipher::new(user_password, &salt)?;
                let mut file = fs::File::open(&full).await?;
                let (mut writer, reader) = plaintext_pipe(PIPE_DEPTH);

                let task_id = file_id.to_string();
                tokio::spawn(async move {
                    match cipher.decrypt_stream(&mut file, &mut writer).await {
                        Ok(bytes) => {
                            debug!(file_id = %task_id, bytes, "ephemeral content streamed")
                        }
                        Err(e) => {
                            warn!(file_id = %task_id, error = %e, "ephemeral decryption failed");
                            writer.abort(e.into_io()).await;
                        }
                    }
                });

                Ok(Box::new(reader))
            }
            EncryptionMode::System => {
                // Vault-DEK-backed ephemeral access is not built yet; check
                // the vault first so a locked vault reports as such.
                if !self.vault.is_unlocked().await {
                    return Err(CoreError::VaultLocked);
                }
                Err(CoreError::SystemModeUnsupported)
            }
        }
    }

    /// Garbage-collects orphaned index entries.
    ///
    /// Fetches the agent's full ID list, diffs it against the IDs that still
    /// exist in storage, and deletes each orphan. Individual deletion
    /// failures are logged and skipped; the batch always runs to completion
    /// and returns how many orphans were actually removed.
    pub async fn reconcile_index(&self, existing_file_ids: &HashSet<String>) -> CoreResult<usize> {
        info!("starting index reconciliation");

        let indexed = self.agent.list_vectors().await?;
        let orphans: Vec<&String> = indexed
            .iter()
            .filter(|id| !existing_file_ids.contains(*id))
            .collect();

        if orphans.is_empty() {
            info!(indexed = indexed.len(), "index is clean, nothing to reconcile");
            return Ok(0);
        }
        warn!(orphans = orphans.len(), "found orphaned index entries");

        let mut deleted = 0usize;
        for id in orphans {
            match self.agent.delete(id).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!(file_id = %id, error = %e, "failed to delete orphaned index entry");
                }
            }
        }

        info!(deleted, "index reconciliation complete");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileRecord;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    struct MapProvider {
        files: HashMap<String, FileRecord>,
    }

    #[async_trait]
    impl FileMetadataProvider for MapProvider {
        async fn get_file_by_id(&self, file_id: &str) -> CoreResult<FileRecord> {
            self.files
                .get(file_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(file_id.to_string()))
        }

        async fn get_file_by_path(&self, storage_path: &str) -> CoreResult<FileRecord> {
            self.files
                .values()
                .find(|f| f.storage_path == storage_path)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(storage_path.to_string()))
        }
    }

    #[derive(Default)]
    struct MockAgent {
        vectors: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        fail_ids: Vec<String>,
    }

    #[async_trait]
    impl IndexAgent for MockAgent {
        async fn process(&self, _payload: IngestPayload) -> CoreResult<()> {
            Ok(())
        }

        async fn delete(&self, file_id: &str) -> CoreResult<()> {
            if self.fail_ids.iter().any(|f| f == file_id) {
                return Err(CoreError::agent(format!("delete failed for {file_id}")));
            }
            self.deleted.lock().unwrap().push(file_id.to_string());
            Ok(())
        }

        async fn list_vectors(&self) -> CoreResult<Vec<String>> {
            Ok(self.vectors.lock().unwrap().clone())
        }
    }

    fn record(id: &str, storage_path: &str, mode: EncryptionMode) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            filename: storage_path.rsplit('/').next().unwrap().to_string(),
            storage_path: storage_path.to_string(),
            encryption: mode,
        }
    }

    async fn feeder_fixture(
        files: Vec<FileRecord>,
        agent: MockAgent,
    ) -> (TempDir, Arc<MockAgent>, BlindAgentFeeder) {
        let tmp = TempDir::new().unwrap();
        let vault = Arc::new(Vault::new(tmp.path().join("vault")));
        vault.setup("master").await.unwrap();

        let provider = MapProvider {
            files: files.into_iter().map(|f| (f.id.clone(), f)).collect(),
        };
        let agent = Arc::new(agent);
        let feeder = BlindAgentFeeder::new(
            Arc::new(provider),
            Arc::clone(&agent) as Arc<dyn IndexAgent>,
            vault,
            tmp.path().join("storage"),
        );
        tokio::fs::create_dir_all(tmp.path().join("storage")).await.unwrap();
        (tmp, agent, feeder)
    }

    #[tokio::test]
    async fn encrypted_files_never_reach_the_indexer() {
        let (_tmp, _agent, feeder) = feeder_fixture(
            vec![record("f1", "geheim.txt.enc", EncryptionMode::User)],
            MockAgent::default(),
        )
        .await;

        for _ in 0..3 {
            assert!(matches!(
                feeder.content_for_indexing("f1").await,
                Err(CoreError::ContentProtected)
            ));
        }
    }

    #[tokio::test]
    async fn plain_files_stream_for_indexing() {
        let (tmp, _agent, feeder) = feeder_fixture(
            vec![record("f1", "notes.txt", EncryptionMode::None)],
            MockAgent::default(),
        )
        .await;
        tokio::fs::write(tmp.path().join("storage/notes.txt"), b"index me")
            .await
            .unwrap();

        let mut stream = feeder.content_for_indexing("f1").await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"index me");

        // Path-based lookup reaches the same gate
        let mut stream = feeder.content_for_indexing_by_path("notes.txt").await.unwrap();
        out.clear();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"index me");
    }

    #[tokio::test]
    async fn ephemeral_access_enforces_password_and_round_trips() {
        let (tmp, _agent, feeder) = feeder_fixture(
            vec![record("f1", "diary.txt.enc", EncryptionMode::User)],
            MockAgent::default(),
        )
        .await;

        // Encrypt a file the way the storage layer would
        let plaintext = b"dear diary, the NAS works".to_vec();
        let enc_path = tmp.path().join("storage/diary.txt.enc");
        let salt = StreamSalt::generate();
        salt.write_sidecar(&enc_path).await.unwrap();
        let cipher = StreamCipher::new("open sesame", &salt).unwrap();
        let mut reader = std::io::Cursor::new(plaintext.clone());
        let mut out_file = tokio::fs::File::create(&enc_path).await.unwrap();
        cipher.encrypt_stream(&mut reader, &mut out_file).await.unwrap();

        // Empty password is refused
        assert!(matches!(
            feeder.ephemeral_content("f1", "").await,
            Err(CoreError::PasswordRequired)
        ));

        // Correct password reproduces the exact plaintext
        let mut stream = feeder.ephemeral_content("f1", "open sesame").await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, plaintext);

        // Wrong password surfaces as a read error, not a hang or silent EOF
        let mut stream = feeder.ephemeral_content("f1", "wrong").await.unwrap();
        let mut out = Vec::new();
        assert!(stream.read_to_end(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn system_mode_is_an_explicit_stub() {
        let (tmp, _agent, feeder) = feeder_fixture(
            vec![record("f1", "sys.bin", EncryptionMode::System)],
            MockAgent::default(),
        )
        .await;
        tokio::fs::write(tmp.path().join("storage/sys.bin"), b"x").await.unwrap();

        assert!(matches!(
            feeder.ephemeral_content("f1", "pw").await,
            Err(CoreError::SystemModeUnsupported)
        ));

        // With the vault locked, the lock state wins
        let vault = Arc::clone(&feeder.vault);
        vault.lock().await.unwrap();
        assert!(matches!(
            feeder.ephemeral_content("f1", "pw").await,
            Err(CoreError::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn reconcile_deletes_orphans_and_tolerates_failures() {
        let agent = MockAgent {
            vectors: Mutex::new(vec![
                "live-1".to_string(),
                "orphan-1".to_string(),
                "orphan-2".to_string(),
                "orphan-broken".to_string(),
            ]),
            deleted: Mutex::new(Vec::new()),
            fail_ids: vec!["orphan-broken".to_string()],
        };
        let (_tmp, agent, feeder) = feeder_fixture(Vec::new(), agent).await;

        let existing: HashSet<String> = ["live-1".to_string()].into_iter().collect();
        let deleted = feeder.reconcile_index(&existing).await.unwrap();

        assert_eq!(deleted, 2, "broken deletion is skipped, not fatal");
        let deleted_ids = agent.deleted.lock().unwrap();
        assert!(deleted_ids.contains(&"orphan-1".to_string()));
        assert!(deleted_ids.contains(&"orphan-2".to_string()));
        assert!(!deleted_ids.contains(&"live-1".to_string()));
    }

    #[tokio::test]
    async fn clean_index_reconciles_to_zero() {
        let agent = MockAgent {
            vectors: Mutex::new(vec!["a".to_string(), "b".to_string()]),
            ..Default::default()
        };
        let (_tmp, _agent, feeder) = feeder_fixture(Vec::new(), agent).await;

        let existing: HashSet<String> =
            ["a".to_string(), "b".to_string()].into_iter().collect();
        assert_eq!(feeder.reconcile_index(&existing).await.unwrap(), 0);
    }
}

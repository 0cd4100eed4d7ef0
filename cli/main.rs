use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use naslock::config::Config;
use naslock::error::{CoreError, CoreResult};
use naslock::honeyfile::{Honeyfile, HoneyfileEvent, HoneyfileGuard, HoneyfileStore};
use naslock::stream::{StreamCipher, StreamSalt};
use naslock::vault::Vault;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// naslock - encrypted storage core for a personal NAS appliance
#[derive(Parser)]
#[command(name = "naslock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the vault with a master password
    Setup,

    /// Unlock the vault
    Unlock,

    /// Lock the vault and wipe key material from memory
    Lock,

    /// Show vault status
    Status,

    /// Encrypt a file into storage (chunked, password-based)
    Encrypt {
        /// Input file to encrypt
        input: PathBuf,

        /// Name in storage (defaults to input filename plus .enc)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Decrypt an encrypted file from storage
    Decrypt {
        /// Encrypted filename in storage
        name: String,

        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage honeyfile decoys
    #[command(subcommand)]
    Honeyfile(HoneyfileCommands),
}

#[derive(Subcommand, Debug)]
enum HoneyfileCommands {
    /// Register a decoy path (synthesizes fake content if absent)
    Add {
        /// Path to monitor
        path: String,

        /// Fake content flavor: finance, it, private
        #[arg(short, long, default_value = "private")]
        fake_type: String,
    },

    /// Remove a decoy record (physical file untouched)
    Remove {
        /// Monitored path
        path: String,
    },

    /// List all registered decoys
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG to control log level (e.g. RUST_LOG=info,naslock=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "naslock starting");

    match cli.command {
        Commands::Setup => cmd_setup(&cli.config).await,
        Commands::Unlock => cmd_unlock(&cli.config).await,
        Commands::Lock => cmd_lock(&cli.config).await,
        Commands::Status => cmd_status(&cli.config).await,
        Commands::Encrypt { input, output } => {
            cmd_encrypt(&cli.config, &input, output.as_deref()).await
        }
        Commands::Decrypt { name, output } => {
            cmd_decrypt(&cli.config, &name, output.as_deref()).await
        }
        Commands::Honeyfile(cmd) => cmd_honeyfile(&cli.config, cmd).await,
    }
}

fn prompt_password(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn cmd_setup(config_path: &str) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let vault = Vault::new(&cfg.vault_dir);

    if vault.is_configured().await {
        anyhow::bail!(
            "vault at {} is already configured; delete the directory to start over",
            cfg.vault_dir
        );
    }

    let password = prompt_password("Master password")?;
    let confirm = prompt_password("Repeat master password")?;
    if password != confirm {
        anyhow::bail!("passwords do not match");
    }
    if password.len() < 8 {
        anyhow::bail!("master password must be at least 8 characters");
    }

    vault.setup(&password).await.context("vault setup failed")?;
    println!("Vault configured and unlocked at {}", cfg.vault_dir);
    Ok(())
}

async fn cmd_unlock(config_path: &str) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let vault = Vault::new(&cfg.vault_dir);

    let password = prompt_password("Master password")?;
    vault.unlock(&password).await.context("unlock failed")?;
    println!("Vault unlocked");
    Ok(())
}

async fn cmd_lock(config_path: &str) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let vault = Vault::new(&cfg.vault_dir);

    match vault.lock().await {
        Ok(()) => println!("Vault locked, key material wiped"),
        Err(CoreError::AlreadyLocked) => println!("Vault is already locked"),
        Err(e) => return Err(e).context("lock failed"),
    }
    Ok(())
}

async fn cmd_status(config_path: &str) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let vault = Vault::new(&cfg.vault_dir);

    let status = vault.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_encrypt(config_path: &str, input: &Path, output: Option<&str>) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    fs::create_dir_all(&cfg.storage_dir).await?;

    let default_name = input
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| format!("{n}.enc"))
        .context("input path has no filename")?;
    let name = output.map(String::from).unwrap_or(default_name);
    let dest = Path::new(&cfg.storage_dir).join(&name);

    let password = prompt_password("Encryption password")?;
    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));
    spinner.set_message("deriving key...");

    let salt = StreamSalt::generate();
    let cipher = StreamCipher::new(&password, &salt)?;

    spinner.set_message(format!("encrypting {}...", input.display()));
    let mut reader = fs::File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    let mut writer = fs::File::create(&dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;

    let bytes = cipher.encrypt_stream(&mut reader, &mut writer).await?;
    salt.write_sidecar(&dest).await?;

    spinner.finish_with_message(format!(
        "encrypted {} ({} bytes) -> {}",
        input.display(),
        bytes,
        dest.display()
    ));
    Ok(())
}

async fn cmd_decrypt(config_path: &str, name: &str, output: Option<&Path>) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let source = Path::new(&cfg.storage_dir).join(name);

    let password = prompt_password("Decryption password")?;
    let salt = StreamSalt::read_sidecar(&source)
        .await
        .context("reading salt sidecar (is this file encrypted?)")?;
    let cipher = StreamCipher::new(&password, &salt)?;

    let mut reader = fs::File::open(&source)
        .await
        .with_context(|| format!("opening {}", source.display()))?;

    match output {
        Some(path) => {
            let mut writer = fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?;
            let bytes = cipher.decrypt_stream(&mut reader, &mut writer).await?;
            println!("decrypted {} bytes -> {}", bytes, path.display());
        }
        None => {
            let mut stdout = tokio::io::stdout();
            cipher.decrypt_stream(&mut reader, &mut stdout).await?;
        }
    }
    Ok(())
}

async fn cmd_honeyfile(config_path: &str, cmd: HoneyfileCommands) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let vault = Arc::new(Vault::new(&cfg.vault_dir));
    let store_path = Path::new(&cfg.storage_dir).join(".honeyfiles.json");
    let store = Arc::new(JsonHoneyfileStore::new(store_path));
    let guard = HoneyfileGuard::new(store, vault);
    guard.reload_cache().await?;

    match cmd {
        HoneyfileCommands::Add { path, fake_type } => {
            let record = guard.create(&path, &fake_type).await?;
            println!("decoy registered: {} (id {})", record.path, record.id);
        }
        HoneyfileCommands::Remove { path } => {
            guard.delete(&path).await?;
            println!("decoy removed: {path}");
        }
        HoneyfileCommands::List => {
            let records = guard.list_all().await?;
            if records.is_empty() {
                println!("no decoys registered");
            }
            for h in records {
                println!("{:>4}  triggers={:<4}  {}  ({})", h.id, h.trigger_count, h.path, h.fake_type);
            }
        }
    }
    Ok(())
}

/// Appliance-local honeyfile store backed by a single JSON file.
///
/// The production deployment keeps records in the appliance database; this
/// store serves standalone CLI use and small installs.
struct JsonHoneyfileStore {
    path: PathBuf,
    io_lock: Mutex<()>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    records: Vec<Honeyfile>,
    events: Vec<HoneyfileEvent>,
}

impl JsonHoneyfileStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            io_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> CoreResult<StoreFile> {
        match fs::read(&self.path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| CoreError::storage(format!("corrupt honeyfile store: {e}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, file: &StoreFile) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(file)
            .map_err(|e| CoreError::storage(e.to_string()))?;
        fs::write(&self.path, data).await?;
        Ok(())
    }
}

#[async_trait]
impl HoneyfileStore for JsonHoneyfileStore {
    async fn get_all_paths(&self) -> CoreResult<Vec<String>> {
        let _guard = self.io_lock.lock().await;
        Ok(self.load().await?.records.into_iter().map(|h| h.path).collect())
    }

    async fn create(&self, path: &str, fake_type: &str) -> CoreResult<Honeyfile> {
        let _guard = self.io_lock.lock().await;
        let mut file = self.load().await?;
        if file.records.iter().any(|h| h.path == path) {
            return Err(CoreError::storage(format!("decoy already registered: {path}")));
        }
        let record = Honeyfile {
            id: file.records.iter().map(|h| h.id).max().unwrap_or(0) + 1,
            path: path.to_string(),
            fake_type: fake_type.to_string(),
            trigger_count: 0,
        };
        file.records.push(record.clone());
        self.save(&file).await?;
        Ok(record)
    }

    async fn delete(&self, path: &str) -> CoreResult<()> {
        let _guard = self.io_lock.lock().await;
        let mut file = self.load().await?;
        let before = file.records.len();
        file.records.retain(|h| h.path != path);
        if file.records.len() == before {
            return Err(CoreError::NotFound(path.to_string()));
        }
        self.save(&file).await?;
        Ok(())
    }

    async fn increment_trigger(&self, path: &str) -> CoreResult<i64> {
        let _guard = self.io_lock.lock().await;
        let mut file = self.load().await?;
        let record = file
            .records
            .iter_mut()
            .find(|h| h.path == path)
            .ok_or_else(|| CoreError::NotFound(path.to_string()))?;
        record.trigger_count += 1;
        let id = record.id;
        self.save(&file).await?;
        Ok(id)
    }

    async fn record_event(&self, event: HoneyfileEvent) -> CoreResult<()> {
        let _guard = self.io_lock.lock().await;
        let mut file = self.load().await?;
        file.events.push(event);
        self.save(&file).await?;
        Ok(())
    }

    async fn list_all(&self) -> CoreResult<Vec<Honeyfile>> {
        let _guard = self.io_lock.lock().await;
        Ok(self.load().await?.records)
    }
}

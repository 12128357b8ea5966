//! pinvault - operator cli for pin-protected credentials and key blobs
//!
//! usage:
//!   pinvault insert --le 31323334 --he <hex> --reset <hex>
//!   pinvault check --label 0 --le 31323334
//!   pinvault reset --label 0 --reset <hex>
//!   pinvault status
//!   pinvault keyblob wrap --key <hex> --algorithm aes --app-id <hex>
//!
//! secrets and blobs are hex. data stored in ~/.pinvault/

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

use pinvault::authset::{algorithm, origin, AuthorizationSet, Tag, Value};
use pinvault::counter::FileCounter;
use pinvault::key_provider::{EncryptionKeyProvider, FileKeyProvider};
use pinvault::{
    Config, CredentialState, HashTreeStore, KeyBlobCodec, KeyBlobContext, LeCredentialManager,
    SoftwareSealingBackend,
};

const CONFIG_FILE: &str = "pinvault.toml";
const SEAL_KEY_FILE: &str = "seal.key";
const COUNTER_FILE: &str = "counter";

#[derive(Parser)]
#[command(name = "pinvault")]
#[command(about = "pin-protected credentials on an authenticated hash tree")]
#[command(version)]
struct Cli {
    /// data directory (default: ~/.pinvault)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// config file (default: <data-dir>/pinvault.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a credential on the first free label
    Insert {
        /// low entropy secret (hex)
        #[arg(long)]
        le: String,

        /// high entropy secret released by a correct check (hex)
        #[arg(long)]
        he: String,

        /// reset secret (hex)
        #[arg(long)]
        reset: String,
    },

    /// Check a low entropy secret and print the released secrets
    Check {
        #[arg(short, long)]
        label: u64,

        /// low entropy secret (hex)
        #[arg(long)]
        le: String,
    },

    /// Clear the wrong attempt counter
    Reset {
        #[arg(short, long)]
        label: u64,

        /// reset secret (hex)
        #[arg(long)]
        reset: String,
    },

    /// Remove a credential and free its label
    Remove {
        #[arg(short, long)]
        label: u64,
    },

    /// Print the wrong attempt counter (-1 if missing or corrupted)
    Attempts {
        #[arg(short, long)]
        label: u64,
    },

    /// Show one label, or every provisioned label
    Status {
        #[arg(short, long)]
        label: Option<u64>,
    },

    /// Wrap or unwrap key blobs
    Keyblob {
        #[command(subcommand)]
        command: KeyblobCommands,
    },
}

#[derive(Subcommand)]
enum KeyblobCommands {
    /// Wrap key material into a blob
    Wrap {
        /// key material (hex)
        #[arg(long)]
        key: String,

        #[arg(long, value_enum, default_value = "aes")]
        algorithm: Algorithm,

        /// key size in bits (default: 8 * key length)
        #[arg(long)]
        key_size: Option<u32>,

        /// application id bound into the blob (hex)
        #[arg(long)]
        app_id: Option<String>,
    },

    /// Unwrap a blob and print its key material
    Unwrap {
        /// key blob (hex)
        #[arg(long)]
        blob: String,

        /// application id the blob was bound to (hex)
        #[arg(long)]
        app_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Algorithm {
    Aes,
    Hmac,
    Ec,
    Rsa,
    TripleDes,
}

impl Algorithm {
    fn value(self) -> u32 {
        match self {
            Algorithm::Aes => algorithm::AES,
            Algorithm::Hmac => algorithm::HMAC,
            Algorithm::Ec => algorithm::EC,
            Algorithm::Rsa => algorithm::RSA,
            Algorithm::TripleDes => algorithm::TRIPLE_DES,
        }
    }
}

/// data directory plus the config that applies to it
struct Vault {
    data_dir: PathBuf,
    config: Config,
}

impl Vault {
    fn open(data_dir: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".pinvault")
        });
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let config = match config_path {
            Some(path) => Config::load(&path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => {
                let default_path = data_dir.join(CONFIG_FILE);
                if default_path.exists() {
                    Config::load(&default_path)
                        .with_context(|| format!("failed to load config {}", default_path.display()))?
                } else {
                    Config::default()
                }
            }
        };

        Ok(Self { data_dir, config })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    fn manager(&self) -> Result<LeCredentialManager<SoftwareSealingBackend>> {
        let geometry = self.config.geometry()?;
        let root_key = FileKeyProvider::new(self.data_dir.join(SEAL_KEY_FILE))
            .export_or_generate_encryption_key()
            .context("failed to load sealing root key")?;

        let counter = FileCounter::open(self.data_dir.join(COUNTER_FILE)).context("failed to open counter")?;
        let store = HashTreeStore::open(self.resolve(&self.config.store.path), geometry, counter, &root_key)
            .context("failed to open hash tree store")?;

        let backend = SoftwareSealingBackend::from_root_key(&root_key);
        warn!("software sealing backend has no hardware security");
        let auth = backend.auth_values();
        Ok(LeCredentialManager::new(store, backend, auth))
    }

    fn keyblob_context(&self) -> KeyBlobContext<FileKeyProvider> {
        let provider = FileKeyProvider::new(self.resolve(&self.config.keyblob.key_path));
        KeyBlobContext::new(
            KeyBlobCodec::new(provider),
            self.config.keyblob.os_version,
            self.config.keyblob.os_patchlevel,
        )
    }
}

fn parse_hex(name: &str, s: &str) -> Result<Vec<u8>> {
    hex::decode(s.trim()).with_context(|| format!("--{} is not valid hex", name))
}

fn app_params(app_id: Option<&str>) -> Result<AuthorizationSet> {
    let mut params = AuthorizationSet::new();
    if let Some(id) = app_id {
        params.push(Tag::APPLICATION_ID, Value::Bytes(parse_hex("app-id", id)?))?;
    }
    Ok(params)
}

fn state_name(state: CredentialState) -> &'static str {
    match state {
        CredentialState::Free => "free",
        CredentialState::Provisioned => "provisioned",
        CredentialState::Locked => "locked",
        CredentialState::Corrupted => "corrupted",
    }
}

fn run(cli: Cli) -> Result<()> {
    let vault = Vault::open(cli.data_dir, cli.config)?;

    match cli.command {
        Commands::Insert { le, he, reset } => {
            let mut mgr = vault.manager()?;
            let schedule = vault.config.delay_schedule();
            let label = mgr.insert_credential(
                &parse_hex("le", &le)?,
                &parse_hex("he", &he)?,
                &parse_hex("reset", &reset)?,
                &schedule,
                &[],
            )?;
            println!("{}", label);
        }
        Commands::Check { label, le } => {
            let mut mgr = vault.manager()?;
            let secrets = mgr.check_credential(label, &parse_hex("le", &le)?)?;
            println!("he_secret: {}", hex::encode(secrets.he_secret.as_slice()));
            println!("reset_secret: {}", hex::encode(secrets.reset_secret.as_slice()));
        }
        Commands::Reset { label, reset } => {
            let mut mgr = vault.manager()?;
            mgr.reset_credential(label, &parse_hex("reset", &reset)?)?;
            println!("reset label {}", label);
        }
        Commands::Remove { label } => {
            let mut mgr = vault.manager()?;
            mgr.remove_credential(label)?;
            println!("removed label {}", label);
        }
        Commands::Attempts { label } => {
            let mgr = vault.manager()?;
            println!("{}", mgr.get_wrong_auth_attempts(label));
        }
        Commands::Status { label } => {
            let mgr = vault.manager()?;
            let labels = match label {
                Some(l) => vec![l],
                None => mgr.store().provisioned_labels(),
            };
            println!("root: {}", hex::encode(mgr.store().root()));
            for l in labels {
                let state = mgr.credential_state(l)?;
                let pcr = match state {
                    CredentialState::Provisioned | CredentialState::Locked => {
                        if mgr.needs_pcr_binding(l)? { " pcr" } else { "" }
                    }
                    _ => "",
                };
                println!("{:>6} {:<12} attempts={}{}", l, state_name(state), mgr.get_wrong_auth_attempts(l), pcr);
            }
        }
        Commands::Keyblob { command } => run_keyblob(&vault, command)?,
    }
    Ok(())
}

fn run_keyblob(vault: &Vault, command: KeyblobCommands) -> Result<()> {
    let ctx = vault.keyblob_context();
    match command {
        KeyblobCommands::Wrap { key, algorithm, key_size, app_id } => {
            let key = parse_hex("key", &key)?;
            if key.is_empty() {
                bail!("--key must not be empty");
            }
            let key_size = key_size.unwrap_or(key.len() as u32 * 8);
            let mut description = app_params(app_id.as_deref())?;
            description.push(Tag::ALGORITHM, Value::U32(algorithm.value()))?;
            description.push(Tag::KEY_SIZE, Value::U32(key_size))?;

            let created = ctx.create_key_blob(&description, origin::IMPORTED, &key)?;
            println!("{}", hex::encode(&created.key_blob));
        }
        KeyblobCommands::Unwrap { blob, app_id } => {
            let blob = parse_hex("blob", &blob)?;
            let params = app_params(app_id.as_deref())?;
            let unpacked = ctx.parse_key_blob(&blob, &params)?;
            println!("key: {}", hex::encode(unpacked.key_material.as_slice()));
            println!("format: {:?}", unpacked.format);
            println!("hw_enforced: {} tags", unpacked.hw_enforced.len());
            println!("sw_enforced: {} tags", unpacked.sw_enforced.len());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pinvault=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse())
}

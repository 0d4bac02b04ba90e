use clap::{Parser, Subcommand};
use pkg_constants::lock::{DEFAULT_BEFORE_EXPIRY_MS, DEFAULT_COLLECTION, DEFAULT_TTL_MS};
use pkg_constants::paths::{DEFAULT_CONFIG, DEFAULT_DATA_DIR};
use pkg_lock::{Lock, LockError, generate_owner};
use pkg_state::{DocumentStore, StateReader, StateStore};
use pkg_types::config::{LockConfigFile, load_config_file};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lockctl", about = "Inspect and hold lease locks in a SlateDB state store")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Collection the lock documents live in
    #[arg(long)]
    collection: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Commands that write (acquire, hold, release) open the data directory as
/// its single SlateDB writer; a second writer fences the first. Running two
/// `hold` processes, or a write command next to a running `hold`, on one
/// data directory is unsupported. `status` and `list` only read.
#[derive(Subcommand)]
enum Commands {
    /// Try to acquire a lock once
    Acquire {
        #[arg(long)]
        id: String,
        #[arg(long)]
        ttl_ms: Option<u64>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Acquire a lock and keep it alive until Ctrl-C, then release it
    Hold {
        #[arg(long)]
        id: String,
        #[arg(long)]
        ttl_ms: Option<u64>,
        #[arg(long)]
        before_expiry_ms: Option<u64>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Release a lock held by an owner
    Release {
        #[arg(long)]
        id: String,
        #[arg(long)]
        owner: String,
        /// Fail unless a held lock was actually removed
        #[arg(long)]
        strict: bool,
    },
    /// Show the stored document for a lock
    Status {
        #[arg(long)]
        id: String,
    },
    /// List all locks in the collection
    List,
}

/// Settings after merging CLI args > config file > defaults.
struct Settings {
    collection: String,
    owner: Option<String>,
    ttl: Duration,
    before_expiry: Duration,
}

impl Settings {
    fn owner_or_generate(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.owner.clone())
            .unwrap_or_else(generate_owner)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn lock_for(store: StateStore, settings: &Settings, id: &str, owner: String) -> Lock {
    let store: Arc<dyn DocumentStore> = Arc::new(store);
    Lock::new(store, id, owner).with_collection(settings.collection.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: LockConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    let settings = Settings {
        collection: cli
            .collection
            .or(file_cfg.collection)
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
        owner: file_cfg.owner,
        ttl: Duration::from_millis(file_cfg.ttl_ms.unwrap_or(DEFAULT_TTL_MS)),
        before_expiry: Duration::from_millis(
            file_cfg.before_expiry_ms.unwrap_or(DEFAULT_BEFORE_EXPIRY_MS),
        ),
    };

    let result = match cli.command {
        Commands::Acquire { id, ttl_ms, owner } => {
            with_writer(&data_dir, |store| acquire(store, &settings, id, ttl_ms, owner)).await
        }
        Commands::Hold {
            id,
            ttl_ms,
            before_expiry_ms,
            owner,
        } => {
            with_writer(&data_dir, |store| {
                hold(store, &settings, id, ttl_ms, before_expiry_ms, owner)
            })
            .await
        }
        Commands::Release { id, owner, strict } => {
            with_writer(&data_dir, |store| release(store, &settings, id, owner, strict)).await
        }
        Commands::Status { id } => status(&data_dir, &settings, &id).await,
        Commands::List => list(&data_dir, &settings).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Open the data dir as its writer, run `f`, then close the store. The
/// command's own error wins over a close error.
async fn with_writer<F, Fut>(data_dir: &str, f: F) -> anyhow::Result<()>
where
    F: FnOnce(StateStore) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let store = StateStore::new(data_dir).await?;
    let result = f(store.clone()).await;
    let closed = store.close().await;
    result?;
    closed?;
    Ok(())
}

async fn acquire(
    store: StateStore,
    settings: &Settings,
    id: String,
    ttl_ms: Option<u64>,
    owner: Option<String>,
) -> anyhow::Result<()> {
    let ttl = ttl_ms.map(Duration::from_millis).unwrap_or(settings.ttl);
    let lock = lock_for(store, settings, &id, settings.owner_or_generate(owner));
    lock.acquire(ttl).await?;

    println!("Lock:     {}", lock.id());
    println!("Owner:    {}", lock.owner());
    if let Some(expires) = lock.expires_at() {
        println!("Expires:  {}", expires.format("%Y-%m-%d %H:%M:%S%.3f"));
    }
    Ok(())
}

async fn hold(
    store: StateStore,
    settings: &Settings,
    id: String,
    ttl_ms: Option<u64>,
    before_expiry_ms: Option<u64>,
    owner: Option<String>,
) -> anyhow::Result<()> {
    let ttl = ttl_ms.map(Duration::from_millis).unwrap_or(settings.ttl);
    let before_expiry = before_expiry_ms
        .map(Duration::from_millis)
        .unwrap_or(settings.before_expiry);
    let lock = lock_for(store, settings, &id, settings.owner_or_generate(owner));

    lock.acquire(ttl).await?;
    lock.keep_alive(before_expiry)?;
    println!(
        "Holding lock {} as {} (ttl={}ms, renew {}ms before expiry). Ctrl-C to release.",
        lock.id(),
        lock.owner(),
        ttl.as_millis(),
        before_expiry.as_millis()
    );

    // The renewal chain ends on its own once the store fences this process
    let mut check = tokio::time::interval(before_expiry);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            _ = check.tick() => {
                if !lock.keep_alive_active() || !lock.is_acquired() {
                    lock.stop_keep_alive();
                    anyhow::bail!(
                        "lost lease on lock {}: renewals stopped (is another lockctl writing to this data dir?)",
                        lock.id()
                    );
                }
            }
        }
    }

    info!("Interrupted, releasing lock {}", lock.id());
    lock.release().await?;
    Ok(())
}

async fn release(
    store: StateStore,
    settings: &Settings,
    id: String,
    owner: String,
    strict: bool,
) -> anyhow::Result<()> {
    let lock = lock_for(store, settings, &id, owner);
    let result = if strict {
        lock.must_release().await
    } else {
        lock.release().await
    };
    match result {
        Ok(()) => println!("Released {}", id),
        Err(LockError::AlreadyReleased { .. }) => {
            anyhow::bail!("lock '{}' was not held by {}", id, lock.owner())
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn status(data_dir: &str, settings: &Settings, id: &str) -> anyhow::Result<()> {
    let reader = StateReader::open(data_dir).await?;
    let doc = reader.get(&settings.collection, id).await;
    reader.close().await?;

    match doc? {
        Some(doc) => {
            println!("Lock:      {}", id);
            println!("Owner:     {}", doc.owner);
            println!("Acquired:  {}", doc.acquired.format("%Y-%m-%d %H:%M:%S%.3f"));
            println!("Expires:   {}", doc.expires.format("%Y-%m-%d %H:%M:%S%.3f"));
            println!("Live:      {}", doc.is_live());
        }
        None => println!("(lock {} is not held)", id),
    }
    Ok(())
}

async fn list(data_dir: &str, settings: &Settings) -> anyhow::Result<()> {
    let reader = StateReader::open(data_dir).await?;
    let docs = reader.list(&settings.collection).await;
    reader.close().await?;
    let docs = docs?;
    let now = chrono::Utc::now();

    println!("{:<32} {:<38} {:<6} {}", "ID", "OWNER", "LIVE", "EXPIRES");
    for (id, doc) in &docs {
        println!(
            "{:<32} {:<38} {:<6} {}",
            id,
            doc.owner,
            doc.is_live_at(now),
            doc.expires.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if docs.is_empty() {
        println!("(no locks in {})", settings.collection);
    }
    Ok(())
}

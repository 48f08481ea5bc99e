use anyhow::{Context, Result};
use clap::Parser;
use feedsync::config::Config;
use feedsync::feed::{
    build_client, filter_items, sorted_view, CategoryCatalog, CategoryFeed, Connectivity,
    FeedPhase, FeedSnapshot, HttpFetcher, SortMode,
};
use feedsync::realtime::{realtime_url, RealtimeChannel};
use feedsync::storage::{Database, DatabaseError, DiskCache};
use feedsync::sync::{DeepLinkResolver, MemoryIndex, SyncCoordinator, SyncEvent, SyncServices};
use feedsync::util::{terminal_line, truncate_to_width};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Items printed per snapshot.
const PREVIEW_ITEMS: usize = 5;
const TITLE_WIDTH: usize = 72;

/// Get the config directory path (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsync"))
}

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Category feed sync with live updates")]
struct Args {
    /// Config file (default: ~/.config/feedsync/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cache database (default: ~/.config/feedsync/feedsync.db)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Category to open instead of the last one used
    #[arg(long, value_name = "KEY")]
    category: Option<String>,

    /// Delete the cache database before starting
    #[arg(long)]
    reset_db: bool,

    /// Resolve one item id (deep link), print it and exit
    #[arg(long, value_name = "ID")]
    resolve: Option<String>,
}

/// A line typed on stdin.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Sync(SyncEvent),
    Filter(Option<String>),
    Sort(SortMode),
    Show,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_lowercase().as_str() {
        "refresh" => Command::Sync(SyncEvent::ManualRefresh),
        "online" => Command::Sync(SyncEvent::ConnectivityChanged(true)),
        "offline" => Command::Sync(SyncEvent::ConnectivityChanged(false)),
        "fg" | "foreground" => Command::Sync(SyncEvent::Foreground),
        "bg" | "background" => Command::Sync(SyncEvent::Background),
        "hint" => Command::Sync(SyncEvent::RealtimeHint),
        "category" | "cat" if !rest.is_empty() => {
            Command::Sync(SyncEvent::SelectCategory(rest.to_string()))
        }
        "category" | "cat" => return Err("Usage: category <key>".to_string()),
        "filter" if !rest.is_empty() => Command::Filter(Some(rest.to_string())),
        "filter" | "unfilter" => Command::Filter(None),
        "sort" => Command::Sort(rest.parse()?),
        "show" | "list" => Command::Show,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("Unknown command: {}", other)),
    };
    Ok(Some(command))
}

/// Client-side presentation of the active feed.
#[derive(Debug, Default)]
struct View {
    sort: SortMode,
    filter: Option<String>,
}

impl View {
    fn print(&self, snapshot: &FeedSnapshot) {
        let phase = snapshot.phase();
        match (&snapshot.error, phase) {
            (Some(e), _) if !e.is_quiet() => {
                println!("[{}] {:?} ({} items) error: {}", snapshot.category, phase, snapshot.items.len(), e)
            }
            _ => println!("[{}] {:?} ({} items)", snapshot.category, phase, snapshot.items.len()),
        }
        if matches!(phase, FeedPhase::InitialLoading) && snapshot.items.is_empty() {
            return;
        }

        let filtered = match &self.filter {
            Some(query) => filter_items(&snapshot.items, query),
            None => snapshot.items.to_vec(),
        };
        let view = sorted_view(&filtered, self.sort);
        for item in view.iter().take(PREVIEW_ITEMS) {
            let title = terminal_line(&item.title);
            let when = item
                .effective_timestamp()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("  {}  {}  ({})", when, truncate_to_width(&title, TITLE_WIDTH), item.id);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // User-only access
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(path = %config_dir.display(), error = %e, "Failed to set config directory permissions to 0700");
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.apply_env();
    tracing::debug!(?config, "Effective configuration");

    let base_url = config.base_url().context("Invalid API base URL")?;

    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| config_dir.join("feedsync.db"));
    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another instance of feedsync appears to be running. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match db.cached_categories().await {
        Ok(cached) => {
            for (category, count) in &cached {
                tracing::debug!(category = %category, items = count, "Disk cache entry");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to list disk cache entries"),
    }

    let client = build_client().context("Failed to build HTTP client")?;
    let fetcher = HttpFetcher::new(client, base_url.clone(), Connectivity::new(true))
        .with_policy(config.fetch_policy())
        .with_endpoints(config.endpoints())
        .with_api_token(config.api_token.take());
    let cache = DiskCache::new(db.clone());
    let index = MemoryIndex::new();

    if let Some(id) = &args.resolve {
        return resolve_once(&config, fetcher, cache, index, id).await;
    }

    let services = SyncServices {
        fetcher,
        cache,
        index,
        db: Some(db),
    };
    let mut coordinator = SyncCoordinator::new(services, config.sync_settings());

    if !config.realtime_path.trim().is_empty() {
        match realtime_url(&base_url, &config.realtime_path) {
            Some(url) => {
                let channel = RealtimeChannel::new(url, config.realtime_backoff())
                    .with_timeouts(config.realtime_timeouts());
                coordinator = coordinator.with_realtime(channel);
            }
            None => tracing::warn!(base = %base_url, "Cannot derive realtime URL, live updates disabled"),
        }
    }

    coordinator.start(args.category.as_deref()).await;
    let mut active_rx = coordinator.subscribe_active();
    let mut snapshot_rx = active_rx.borrow_and_update().subscribe();

    let (event_tx, event_rx) = mpsc::channel::<SyncEvent>(32);
    let coordinator_task = tokio::spawn(coordinator.run(event_rx));

    run_console(&event_tx, &mut active_rx, &mut snapshot_rx).await?;

    let _ = event_tx.send(SyncEvent::Shutdown).await;
    coordinator_task
        .await
        .context("Coordinator task failed")?;

    println!("Goodbye!");
    Ok(())
}

/// Multiplexes signals, stdin commands and snapshot updates until quit.
async fn run_console(
    event_tx: &mpsc::Sender<SyncEvent>,
    active_rx: &mut watch::Receiver<Arc<CategoryFeed>>,
    snapshot_rx: &mut watch::Receiver<FeedSnapshot>,
) -> Result<()> {
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate())?;
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut view = View::default();

    loop {
        #[cfg(unix)]
        let sigterm_fut = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_fut = std::future::pending::<Option<()>>();

        #[cfg(unix)]
        let sigint_fut = sigint.recv();
        #[cfg(not(unix))]
        let sigint_fut = async {
            let _ = tokio::signal::ctrl_c().await;
            Some(())
        };

        tokio::select! {
            biased;

            _ = sigterm_fut => {
                tracing::info!("Received SIGTERM, shutting down gracefully");
                break;
            }

            _ = sigint_fut => {
                tracing::info!("Received SIGINT, shutting down gracefully");
                break;
            }

            changed = active_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                *snapshot_rx = active_rx.borrow_and_update().subscribe();
                let snapshot = snapshot_rx.borrow_and_update().clone();
                view.print(&snapshot);
            }

            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshot_rx.borrow_and_update().clone();
                view.print(&snapshot);
            }

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(Command::Show)) => view.print(&snapshot_rx.borrow().clone()),
                    Ok(Some(Command::Sort(mode))) => {
                        view.sort = mode;
                        view.print(&snapshot_rx.borrow().clone());
                    }
                    Ok(Some(Command::Filter(filter))) => {
                        view.filter = filter.clone();
                        if event_tx.send(SyncEvent::FilterChanged(filter)).await.is_err() {
                            break;
                        }
                        view.print(&snapshot_rx.borrow().clone());
                    }
                    Ok(Some(Command::Sync(event))) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(message) => eprintln!("{}", message),
                },
                // Keep syncing without a console
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
        }
    }
    Ok(())
}

/// `--resolve`: warms the index from the disk cache, then resolves `id`.
async fn resolve_once(
    config: &Config,
    fetcher: HttpFetcher,
    cache: DiskCache,
    index: MemoryIndex,
    id: &str,
) -> Result<()> {
    let catalog: CategoryCatalog = config.catalog();
    for key in catalog.keys() {
        index.insert_all(&cache.load(key).await);
    }

    let (window, interval) = config.deeplink_polling();
    let resolver = DeepLinkResolver::new(index, fetcher).with_polling(window, interval);
    let item = resolver
        .resolve(id)
        .await
        .with_context(|| format!("Failed to resolve item '{}'", id))?;

    println!("{}", terminal_line(&item.title));
    println!("  id:   {}", item.id);
    if !item.url.is_empty() {
        println!("  url:  {}", terminal_line(&item.url));
    }
    if let Some(ts) = item.effective_timestamp() {
        println!("  time: {}", ts.to_rfc3339());
    }
    if let Some(summary) = &item.summary {
        println!("  {}", truncate_to_width(&terminal_line(summary), 200));
    }
    Ok(())
}

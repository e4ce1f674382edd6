//! Command line interface for operating the relay. Supports initialization,
//! ingesting event files, serving the HTTP and WebSocket endpoints, and
//! signature verification.

mod config;
mod error;
mod event;
mod filter;
mod indexer;
mod registry;
mod relay;
mod server;
mod store;
mod validate;
mod ws;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use tracing::info;

use config::Settings;
use relay::Relay;
use store::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "rivr",
    author,
    version,
    about = "Nostr relay with live subscriptions and a profile indexer",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the directory tree at `STORE_ROOT`.
    Init,
    /// Ingest one or more event files.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Launch the HTTP and WebSocket services.
    Serve,
    /// Verify a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::new(cfg.store_root.clone(), cfg.max_events);
    match cli.command {
        Commands::Init => {
            store.init()?;
        }
        Commands::Ingest { files } => {
            store.init()?;
            store.load()?;
            // Historical imports skip the timestamp window but never the id
            // check; signatures are checked when VERIFY_SIG is on.
            for f in files {
                let data = fs::read_to_string(&f)?;
                let ev: event::Event = serde_json::from_str(&data)?;
                event::verify_id(&ev)?;
                if cfg.verify_sig {
                    event::verify_signature(&ev)?;
                }
                store.insert(&ev)?;
            }
        }
        Commands::Serve => {
            store.init()?;
            let loaded = store.load()?;
            info!(loaded, "event log replayed");
            let http_addr: SocketAddr = cfg.bind_http.as_str().parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.as_str().parse()?;
            let relay = Arc::new(Relay::new(&cfg, store));
            tokio::try_join!(
                server::serve_http(http_addr, relay.clone(), std::future::pending()),
                ws::serve_ws(ws_addr, relay, std::future::pending())
            )?;
        }
        Commands::Verify { sample } => {
            store.init()?;
            store.load()?;
            let checked = store.verify_sample(sample)?;
            info!(checked, "sample verified");
        }
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("rivr-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("BIND_WS=127.0.0.1:7778\n");
    content.push_str("VERIFY_SIG=0\n");
    content.push_str("MAX_PAST_SECS=3600\n");
    content.push_str("MAX_FUTURE_SECS=300\n");
    content.push_str("MAX_EVENT_BYTES=16384\n");
    content.push_str("MAX_EVENTS=1000000\n");
    content.push_str("MAX_SUBS_PER_CONN=32\n");
    content.push_str("QUEUE_CAPACITY=256\n");
    content.push_str("SLOW_POLICY=drop-oldest\n");
    content.push_str("DEFAULT_LIMIT=100\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rivr=info")),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_hash, Event};
    use std::{fs, sync::Mutex, time::Duration};
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 12] = [
        "STORE_ROOT",
        "BIND_HTTP",
        "BIND_WS",
        "VERIFY_SIG",
        "MAX_PAST_SECS",
        "MAX_FUTURE_SECS",
        "MAX_EVENT_BYTES",
        "MAX_EVENTS",
        "MAX_SUBS_PER_CONN",
        "QUEUE_CAPACITY",
        "SLOW_POLICY",
        "DEFAULT_LIMIT",
    ];

    fn clear_vars() {
        for v in ALL_VARS.iter() {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir, extra: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nBIND_HTTP=127.0.0.1:0\nBIND_WS=127.0.0.1:0\nVERIFY_SIG=0\n{}",
            dir.path().to_str().unwrap(),
            extra
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    #[tokio::test]
    async fn run_init_ingest_verify() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "");

        run(Cli {
            env: env_file.clone(),
            command: Commands::Init,
        })
        .await
        .unwrap();
        assert!(dir.path().join("log").exists());

        let ev_path = dir.path().join("ev.json");
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode([1u8; 32]),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        ev.id = hex::encode(event_hash(&ev).unwrap());
        fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();
        run(Cli {
            env: env_file.clone(),
            command: Commands::Ingest {
                files: vec![ev_path.to_str().unwrap().into()],
            },
        })
        .await
        .unwrap();
        assert!(dir.path().join("log/events.ndjson").exists());

        // verify with zero sample to avoid the signature check
        run(Cli {
            env: env_file,
            command: Commands::Verify { sample: 0 },
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn ingest_rejects_bad_id() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "");
        let ev_path = dir.path().join("bad.json");
        let ev = Event {
            id: "ff".repeat(32),
            pubkey: hex::encode([1u8; 32]),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();
        let res = run(Cli {
            env: env_file,
            command: Commands::Ingest {
                files: vec![ev_path.to_str().unwrap().into()],
            },
        })
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn init_creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Init,
        })
        .await
        .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let expected_root = dir.path().join("rivr-data");
        assert!(data.contains(&format!("STORE_ROOT={}", expected_root.to_string_lossy())));
        assert!(data.contains("BIND_HTTP=127.0.0.1:7777"));
        assert!(data.contains("BIND_WS=127.0.0.1:7778"));
        assert!(data.contains("SLOW_POLICY=drop-oldest"));
        assert!(expected_root.join("log").exists());
    }

    #[tokio::test]
    async fn run_serve_starts_http_and_ws() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_port = http_listener.local_addr().unwrap().port();
        drop(http_listener);
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_port = ws_listener.local_addr().unwrap().port();
        drop(ws_listener);
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nBIND_HTTP=127.0.0.1:{}\nBIND_WS=127.0.0.1:{}\nVERIFY_SIG=0\n",
            dir.path().to_str().unwrap(),
            http_port,
            ws_port
        );
        fs::write(&env_path, content).unwrap();
        let env_str = env_path.to_str().unwrap().to_string();

        let handle = task::spawn(run(Cli {
            env: env_str,
            command: Commands::Serve,
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let url = format!("http://127.0.0.1:{}/health", http_port);
        let resp = reqwest::get(url).await.unwrap();
        assert!(resp.status().is_success());
        let ws_url = format!("ws://127.0.0.1:{}/", ws_port);
        let (ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
        drop(ws);
        handle.abort();
    }
}

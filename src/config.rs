//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all storage.
    pub store_root: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Enable Schnorr signature verification on ingest.
    pub verify_sig: bool,
    /// Accepted `created_at` skew into the past, in seconds.
    pub max_past_secs: u64,
    /// Accepted `created_at` skew into the future, in seconds.
    pub max_future_secs: u64,
    /// Maximum serialized event size in bytes.
    pub max_event_bytes: usize,
    /// Maximum number of events the store will hold.
    pub max_events: usize,
    /// Maximum concurrent subscriptions per connection.
    pub max_subs_per_conn: usize,
    /// Outbound frame queue depth per connection.
    pub queue_capacity: usize,
    /// What to do with a connection whose queue overflows.
    pub slow_policy: SlowPolicy,
    /// Backlog size per filter when the client gives no limit.
    pub default_limit: usize,
}

/// Behavior when a connection's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowPolicy {
    /// Evict the oldest queued frame and note the gap.
    DropOldest,
    /// Close the connection.
    Disconnect,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT")?);
        let bind_http = env::var("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS")?;
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1";
        let max_past_secs = env_parse("MAX_PAST_SECS", 3600)?;
        let max_future_secs = env_parse("MAX_FUTURE_SECS", 300)?;
        let max_event_bytes = env_parse("MAX_EVENT_BYTES", 16384)?;
        let max_events = env_parse("MAX_EVENTS", 1_000_000)?;
        let max_subs_per_conn = env_parse("MAX_SUBS_PER_CONN", 32)?;
        let queue_capacity = env_parse("QUEUE_CAPACITY", 256)?;
        let default_limit = env_parse("DEFAULT_LIMIT", 100)?;
        let slow_policy = match env::var("SLOW_POLICY")
            .unwrap_or_else(|_| "drop-oldest".into())
            .as_str()
        {
            "disconnect" => SlowPolicy::Disconnect,
            "drop-oldest" => SlowPolicy::DropOldest,
            other => anyhow::bail!("unknown SLOW_POLICY value: {other}"),
        };
        Ok(Self {
            store_root,
            bind_http,
            bind_ws,
            verify_sig,
            max_past_secs,
            max_future_secs,
            max_event_bytes,
            max_events,
            max_subs_per_conn,
            queue_capacity,
            slow_policy,
            default_limit,
        })
    }
}

/// Read a numeric variable, falling back to `default` when unset.
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse()
            .with_context(|| format!("parsing {name}={s}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

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
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "VERIFY_SIG=1\n",
                "MAX_PAST_SECS=600\n",
                "MAX_FUTURE_SECS=60\n",
                "MAX_EVENT_BYTES=4096\n",
                "MAX_EVENTS=5000\n",
                "MAX_SUBS_PER_CONN=8\n",
                "QUEUE_CAPACITY=64\n",
                "SLOW_POLICY=disconnect\n",
                "DEFAULT_LIMIT=50\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp"));
        assert_eq!(cfg.bind_http, "127.0.0.1:8080");
        assert_eq!(cfg.bind_ws, "127.0.0.1:8081");
        assert!(cfg.verify_sig);
        assert_eq!(cfg.max_past_secs, 600);
        assert_eq!(cfg.max_future_secs, 60);
        assert_eq!(cfg.max_event_bytes, 4096);
        assert_eq!(cfg.max_events, 5000);
        assert_eq!(cfg.max_subs_per_conn, 8);
        assert_eq!(cfg.queue_capacity, 64);
        assert_eq!(cfg.slow_policy, SlowPolicy::Disconnect);
        assert_eq!(cfg.default_limit, 50);
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert!(!cfg.verify_sig);
        assert_eq!(cfg.max_past_secs, 3600);
        assert_eq!(cfg.max_future_secs, 300);
        assert_eq!(cfg.max_event_bytes, 16384);
        assert_eq!(cfg.max_events, 1_000_000);
        assert_eq!(cfg.max_subs_per_conn, 32);
        assert_eq!(cfg.queue_capacity, 256);
        assert_eq!(cfg.slow_policy, SlowPolicy::DropOldest);
        assert_eq!(cfg.default_limit, 100);
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!("BIND_HTTP=127.0.0.1:8080\n", "BIND_WS=127.0.0.1:8081\n"),
        )
        .unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn unknown_slow_policy_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "SLOW_POLICY=panic\n"
            ),
        )
        .unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn invalid_numeric_value_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "QUEUE_CAPACITY=lots\n"
            ),
        )
        .unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }
}

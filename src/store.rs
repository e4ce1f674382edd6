//! Event table with an append-only log and filter queries.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::Write,
    path::PathBuf,
    sync::RwLock,
};

use rand::{seq::SliceRandom, thread_rng};
use tracing::warn;

use crate::error::{Rejection, RelayError, Result};
use crate::event::{self, Event};
use crate::filter::Filter;

/// Outcome of an insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// The event was new and is now stored.
    Stored,
    /// An event with this id already exists; nothing changed.
    AlreadyExists,
}

/// Shared event store rooted at `root`.
///
/// Accepted events live in an in-memory table that answers queries and live
/// matching; every insertion is also appended to `log/events.ndjson` so the
/// table can be rebuilt on startup. Writes are serialized through the write
/// lock, reads run concurrently.
pub struct Store {
    root: PathBuf,
    max_events: usize,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    by_id: HashMap<String, usize>,
}

impl Store {
    /// Create a store rooted at `root` holding at most `max_events` events.
    pub fn new(root: PathBuf, max_events: usize) -> Self {
        Self {
            root,
            max_events,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("log"))?;
        Ok(())
    }

    /// Replay the event log into memory. Returns the number of events loaded.
    pub fn load(&self) -> Result<usize> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(0);
        }
        let data = fs::read_to_string(path)?;
        let mut inner = self.inner.write().unwrap();
        let mut loaded = 0;
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            // A crash mid-append can leave a truncated final line; skip it
            // rather than refusing to start.
            let ev: Event = match serde_json::from_str(line) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("skipping unparseable log line: {e}");
                    continue;
                }
            };
            if inner.by_id.contains_key(&ev.id) {
                continue;
            }
            let idx = inner.events.len();
            inner.by_id.insert(ev.id.clone(), idx);
            inner.events.push(ev);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Insert an event, appending it to the log.
    ///
    /// A duplicate identifier is a no-op, not an error. A full store rejects
    /// the write with [`RelayError::ResourceExhausted`].
    pub fn insert(&self, ev: &Event) -> Result<Inserted> {
        let mut inner = self.inner.write().unwrap();
        if inner.by_id.contains_key(&ev.id) {
            return Ok(Inserted::AlreadyExists);
        }
        if inner.events.len() >= self.max_events {
            return Err(RelayError::ResourceExhausted(format!(
                "event store at capacity ({} events)",
                self.max_events
            )));
        }
        self.append_log(ev)?;
        let idx = inner.events.len();
        inner.by_id.insert(ev.id.clone(), idx);
        inner.events.push(ev.clone());
        Ok(Inserted::Stored)
    }

    /// Evaluate a filter list against the stored events.
    ///
    /// Filters combine with OR; results are deduplicated by id, ordered by
    /// descending `created_at` (id as tiebreak), and each filter's slice is
    /// capped at its own limit, or `default_limit` when unset.
    pub fn query(&self, filters: &[Filter], default_limit: usize) -> Vec<Event> {
        let inner = self.inner.read().unwrap();
        let mut picked: Vec<&Event> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for f in filters {
            let mut matches: Vec<&Event> =
                inner.events.iter().filter(|ev| f.matches(ev)).collect();
            matches.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.id.cmp(&a.id))
            });
            matches.truncate(f.limit.unwrap_or(default_limit));
            for ev in matches {
                if seen.insert(ev.id.as_str()) {
                    picked.push(ev);
                }
            }
        }
        picked.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        picked.into_iter().cloned().collect()
    }

    /// Visit every stored event in insertion order.
    pub fn for_each(&self, mut f: impl FnMut(&Event)) {
        let inner = self.inner.read().unwrap();
        for ev in &inner.events {
            f(ev);
        }
    }

    /// Look up a single event by id.
    pub fn get(&self, id: &str) -> Option<Event> {
        let inner = self.inner.read().unwrap();
        inner.by_id.get(id).map(|&i| inner.events[i].clone())
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().events.len()
    }

    /// Verify id and Schnorr signature for a random sample of stored events.
    pub fn verify_sample(&self, sample: usize) -> Result<usize> {
        let picked: Vec<Event> = {
            let inner = self.inner.read().unwrap();
            let mut refs: Vec<&Event> = inner.events.iter().collect();
            refs.shuffle(&mut thread_rng());
            refs.into_iter().take(sample).cloned().collect()
        };
        for ev in &picked {
            event::verify_id(ev).map_err(|_| Rejection::InvalidId)?;
            event::verify_signature(ev).map_err(|_| Rejection::InvalidSignature)?;
        }
        Ok(picked.len())
    }

    fn log_path(&self) -> PathBuf {
        self.root.join("log/events.ndjson")
    }

    fn append_log(&self, ev: &Event) -> Result<()> {
        let path = self.log_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
        serde_json::to_writer(&mut f, ev)?;
        f.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_hash, Tag};
    use secp256k1::{Keypair, Message, Secp256k1};
    use tempfile::TempDir;

    fn sample_event(seed: u8, pubkey: &str, kind: u32, created: u64) -> Event {
        let mut ev = Event {
            id: String::new(),
            pubkey: pubkey.into(),
            kind,
            created_at: created,
            tags: vec![Tag(vec!["t".into(), format!("topic{seed}")])],
            content: format!("content {seed}"),
            sig: String::new(),
        };
        ev.id = hex::encode(event_hash(&ev).unwrap());
        ev
    }

    fn signed_event(kind: u32) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(kp.x_only_public_key().0.serialize()),
            kind,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let hash = event_hash(&ev).unwrap();
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).unwrap();
        ev.sig = hex::encode(secp.sign_schnorr_no_aux_rand(&msg, &kp).as_ref());
        ev
    }

    fn store(dir: &TempDir) -> Store {
        let s = Store::new(dir.path().to_path_buf(), 1000);
        s.init().unwrap();
        s
    }

    #[test]
    fn insert_then_query_by_id_returns_exactly_that_event() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let ev = sample_event(1, "p1", 1, 10);
        assert_eq!(s.insert(&ev).unwrap(), Inserted::Stored);
        let f = Filter {
            ids: Some(vec![ev.id.clone()]),
            ..Filter::default()
        };
        let res = s.query(&[f], 100);
        assert_eq!(res, vec![ev]);
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let ev = sample_event(1, "p1", 1, 10);
        assert_eq!(s.insert(&ev).unwrap(), Inserted::Stored);
        assert_eq!(s.insert(&ev).unwrap(), Inserted::AlreadyExists);
        assert_eq!(s.len(), 1);
        // The log holds a single line as well.
        let log = std::fs::read_to_string(dir.path().join("log/events.ndjson")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn capacity_rejects_new_writes() {
        let dir = TempDir::new().unwrap();
        let s = Store::new(dir.path().to_path_buf(), 2);
        s.init().unwrap();
        s.insert(&sample_event(1, "p1", 1, 1)).unwrap();
        s.insert(&sample_event(2, "p1", 1, 2)).unwrap();
        let err = s.insert(&sample_event(3, "p1", 1, 3)).unwrap_err();
        assert!(matches!(err, RelayError::ResourceExhausted(_)));
        // Duplicates of stored events are still a no-op, not an error.
        assert_eq!(
            s.insert(&sample_event(1, "p1", 1, 1)).unwrap(),
            Inserted::AlreadyExists
        );
    }

    #[test]
    fn query_orders_newest_first_and_respects_limit() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        for (seed, created) in [(1u8, 10u64), (2, 30), (3, 20)] {
            s.insert(&sample_event(seed, "p1", 1, created)).unwrap();
        }
        let f = Filter {
            authors: Some(vec!["p1".into()]),
            ..Filter::default()
        };
        let res = s.query(&[f.clone()], 100);
        let times: Vec<u64> = res.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![30, 20, 10]);

        let capped = Filter {
            limit: Some(2),
            ..f
        };
        let res = s.query(&[capped], 100);
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].created_at, 30);
    }

    #[test]
    fn or_across_filters_deduplicates() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let a = sample_event(1, "a", 1, 10);
        let b = sample_event(2, "b", 2, 20);
        s.insert(&a).unwrap();
        s.insert(&b).unwrap();
        let by_author = Filter {
            authors: Some(vec!["a".into()]),
            ..Filter::default()
        };
        let by_kind = Filter {
            kinds: Some(vec![1, 2]),
            ..Filter::default()
        };
        let res = s.query(&[by_author, by_kind], 100);
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].id, b.id);
        assert_eq!(res[1].id, a.id);
    }

    #[test]
    fn empty_filter_list_returns_nothing() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.insert(&sample_event(1, "p1", 1, 10)).unwrap();
        assert!(s.query(&[], 100).is_empty());
    }

    #[test]
    fn limit_zero_returns_empty_backlog() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.insert(&sample_event(1, "p1", 1, 10)).unwrap();
        let f = Filter {
            limit: Some(0),
            ..Filter::default()
        };
        assert!(s.query(&[f], 100).is_empty());
    }

    #[test]
    fn load_replays_the_log() {
        let dir = TempDir::new().unwrap();
        let ids: Vec<String> = {
            let s = store(&dir);
            let evs = [
                sample_event(1, "p1", 1, 10),
                sample_event(2, "p2", 1, 20),
            ];
            for ev in &evs {
                s.insert(ev).unwrap();
            }
            evs.iter().map(|e| e.id.clone()).collect()
        };
        let s = Store::new(dir.path().to_path_buf(), 1000);
        assert_eq!(s.load().unwrap(), 2);
        for id in &ids {
            assert!(s.get(id).is_some());
        }
    }

    #[test]
    fn load_skips_truncated_log_line() {
        let dir = TempDir::new().unwrap();
        let ev = sample_event(1, "p1", 1, 10);
        {
            let s = store(&dir);
            s.insert(&ev).unwrap();
        }
        // Simulate a crash mid-append.
        let log_path = dir.path().join("log/events.ndjson");
        let mut log = std::fs::read_to_string(&log_path).unwrap();
        log.push_str("{\"id\":\"trunc");
        std::fs::write(&log_path, log).unwrap();

        let s = Store::new(dir.path().to_path_buf(), 1000);
        assert_eq!(s.load().unwrap(), 1);
        assert!(s.get(&ev.id).is_some());
    }

    #[test]
    fn verify_sample_checks_events() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.insert(&signed_event(1)).unwrap();
        s.insert(&signed_event(2)).unwrap();
        assert_eq!(s.verify_sample(10).unwrap(), 2);

        let unsigned = sample_event(9, "p1", 1, 5);
        s.insert(&unsigned).unwrap();
        assert!(s.verify_sample(10).is_err());
    }
}

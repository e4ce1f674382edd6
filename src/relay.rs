//! Coordination between validation, storage, subscriptions, and delivery.

use std::sync::Arc;

use tracing::debug;

use crate::config::Settings;
use crate::error::{Rejection, RelayError, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::indexer::Indexer;
use crate::registry::{ConnId, OutFrame, Outbound, Registry};
use crate::store::{Inserted, Store};
use crate::validate::{self, Limits};

/// What became of a submitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Validated, stored, and fanned out.
    Accepted,
    /// Already stored; nothing changed.
    Duplicate,
    /// Refused by the validator.
    Rejected(Rejection),
    /// The store is at capacity.
    Exhausted,
}

/// The relay core: one store, one registry, one indexer.
///
/// `publish` and `subscribe` both run their critical sections under the
/// registry lock, giving every insertion a linearization point with respect
/// to subscription churn: a subscription registered before an insertion
/// completes sees the event exactly once, in its backlog or live, never both
/// and never neither.
pub struct Relay {
    store: Store,
    registry: Registry,
    indexer: Indexer,
    limits: Limits,
    max_subs_per_conn: usize,
    default_limit: usize,
}

impl Relay {
    pub fn new(settings: &Settings, store: Store) -> Self {
        // Derived indexer state is not persisted; rebuild it from whatever
        // the store already holds (e.g. a replayed log).
        let indexer = Indexer::new();
        store.for_each(|ev| indexer.index_event(ev));
        Self {
            store,
            registry: Registry::new(settings.queue_capacity, settings.slow_policy),
            indexer,
            limits: Limits {
                verify_sig: settings.verify_sig,
                max_past_secs: settings.max_past_secs,
                max_future_secs: settings.max_future_secs,
                max_event_bytes: settings.max_event_bytes,
            },
            max_subs_per_conn: settings.max_subs_per_conn,
            default_limit: settings.default_limit,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Register a connection, handing back its id and outbound queue.
    pub fn connect(&self) -> (ConnId, Arc<Outbound>) {
        self.registry.connect()
    }

    /// Tear down a connection, implicitly closing all its subscriptions.
    pub fn disconnect(&self, conn: ConnId) {
        self.registry.disconnect(conn);
    }

    /// Validate and store an event, then fan it out to live subscriptions.
    pub fn publish(&self, ev: Event) -> Result<PublishOutcome> {
        if let Err(rejection) = validate::validate(&ev, &self.limits) {
            debug!(id = %ev.id, %rejection, "event rejected");
            return Ok(PublishOutcome::Rejected(rejection));
        }
        let outcome = {
            let mut conns = self.registry.lock();
            match self.store.insert(&ev) {
                Ok(Inserted::Stored) => {
                    Registry::fan_out(&mut conns, &ev);
                    PublishOutcome::Accepted
                }
                Ok(Inserted::AlreadyExists) => PublishOutcome::Duplicate,
                Err(RelayError::ResourceExhausted(_)) => PublishOutcome::Exhausted,
                Err(e) => return Err(e),
            }
        };
        if outcome == PublishOutcome::Accepted {
            self.indexer.index_event(&ev);
            debug!(id = %ev.id, kind = ev.kind, "event accepted");
        }
        Ok(outcome)
    }

    /// Open or replace a subscription and enqueue its backlog plus `EOSE`.
    ///
    /// Re-sending the same id replaces the filter list; exceeding the
    /// per-connection cap yields a `CLOSED` frame instead.
    pub fn subscribe(&self, conn: ConnId, sub_id: &str, filters: Vec<Filter>) {
        let mut conns = self.registry.lock();
        let Some(state) = conns.get_mut(&conn) else {
            return;
        };
        if !state.subs.contains_key(sub_id) && state.subs.len() >= self.max_subs_per_conn {
            state.outbound.push(OutFrame::Closed {
                sub_id: sub_id.to_string(),
                message: format!(
                    "too many subscriptions (limit {})",
                    self.max_subs_per_conn
                ),
            });
            return;
        }
        state.subs.insert(sub_id.to_string(), filters.clone());
        for event in self.store.query(&filters, self.default_limit) {
            state.outbound.push(OutFrame::Event {
                sub_id: sub_id.to_string(),
                event,
            });
        }
        state.outbound.push(OutFrame::Eose {
            sub_id: sub_id.to_string(),
        });
    }

    /// Close one subscription; unknown ids are a no-op.
    pub fn unsubscribe(&self, conn: ConnId, sub_id: &str) {
        self.registry.close(conn, sub_id);
    }
}

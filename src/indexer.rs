//! Profile and contact indexing over accepted events.
//!
//! Kind-0 events carry profile metadata as JSON content; kind-3 events carry
//! a contact list as `p` tags. The indexer keeps both in memory together with
//! a lowercase term index for profile search, and is fed by the relay as
//! events are accepted.

use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::Event;
use crate::validate::now_unix;

/// Profile data extracted from a kind-0 event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub pubkey: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub banner: Option<String>,
    pub website: Option<String>,
    pub nip05: Option<String>,
    pub created_at: u64,
    pub indexed_at: u64,
    pub search_terms: Vec<String>,
}

/// One follower → following edge extracted from a kind-3 event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub follower_pubkey: String,
    pub following_pubkey: String,
    pub relay: Option<String>,
    pub petname: Option<String>,
    pub created_at: u64,
    pub indexed_at: u64,
}

/// Paged search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSearchResult {
    pub profiles: Vec<Profile>,
    pub total_count: usize,
    pub page: usize,
    pub per_page: usize,
}

/// Aggregate indexer statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerStats {
    pub total_profiles: usize,
    pub total_relationships: usize,
    pub last_indexed: Option<u64>,
    pub search_index_size: usize,
}

#[derive(Default)]
struct IndexState {
    profiles: HashMap<String, Profile>,
    contacts: HashMap<(String, String), Contact>,
    contact_list_at: HashMap<String, u64>,
    terms: HashMap<String, HashSet<String>>,
    last_indexed: Option<u64>,
}

/// In-memory profile/contact index derived from relay events.
pub struct Indexer {
    state: RwLock<IndexState>,
}

impl Indexer {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Feed one accepted event into the index. Non-indexable kinds are
    /// ignored; malformed profile content is logged and skipped, never an
    /// acceptance failure.
    pub fn index_event(&self, ev: &Event) {
        match ev.kind {
            0 => self.index_profile(ev),
            3 => self.index_contacts(ev),
            _ => {}
        }
    }

    fn index_profile(&self, ev: &Event) {
        let data: serde_json::Value = match serde_json::from_str(&ev.content) {
            Ok(v) => v,
            Err(e) => {
                warn!(pubkey = %ev.pubkey, "skipping unparseable profile content: {e}");
                return;
            }
        };
        let mut st = self.state.write().unwrap();
        if let Some(existing) = st.profiles.get(&ev.pubkey) {
            if existing.created_at > ev.created_at {
                return;
            }
        }
        let search_terms = profile_search_terms(&data);
        let field = |name: &str| data.get(name).and_then(|v| v.as_str()).map(String::from);
        let profile = Profile {
            pubkey: ev.pubkey.clone(),
            name: field("name"),
            display_name: field("display_name"),
            about: field("about"),
            picture: field("picture"),
            banner: field("banner"),
            website: field("website"),
            nip05: field("nip05"),
            created_at: ev.created_at,
            indexed_at: now_unix(),
            search_terms: search_terms.clone(),
        };
        // Drop stale term entries before indexing the fresh ones.
        if let Some(old) = st.profiles.insert(ev.pubkey.clone(), profile) {
            for term in &old.search_terms {
                let now_empty = st
                    .terms
                    .get_mut(term)
                    .map(|keys| {
                        keys.remove(&ev.pubkey);
                        keys.is_empty()
                    })
                    .unwrap_or(false);
                if now_empty {
                    st.terms.remove(term);
                }
            }
        }
        for term in search_terms {
            st.terms.entry(term).or_default().insert(ev.pubkey.clone());
        }
        st.last_indexed = Some(now_unix());
        debug!(pubkey = %ev.pubkey, "indexed profile");
    }

    fn index_contacts(&self, ev: &Event) {
        let mut st = self.state.write().unwrap();
        if let Some(&at) = st.contact_list_at.get(&ev.pubkey) {
            if at > ev.created_at {
                return;
            }
        }
        // A kind-3 event is the complete contact list for its author.
        st.contacts
            .retain(|(follower, _), _| follower != &ev.pubkey);
        let mut count = 0;
        for tag in ev.tags.iter() {
            let fields = &tag.0;
            if fields.len() >= 2 && fields[0] == "p" {
                let contact = Contact {
                    follower_pubkey: ev.pubkey.clone(),
                    following_pubkey: fields[1].clone(),
                    relay: fields.get(2).cloned().filter(|s| !s.is_empty()),
                    petname: fields.get(3).cloned().filter(|s| !s.is_empty()),
                    created_at: ev.created_at,
                    indexed_at: now_unix(),
                };
                st.contacts
                    .insert((ev.pubkey.clone(), fields[1].clone()), contact);
                count += 1;
            }
        }
        st.contact_list_at.insert(ev.pubkey.clone(), ev.created_at);
        st.last_indexed = Some(now_unix());
        debug!(pubkey = %ev.pubkey, count, "indexed contact list");
    }

    /// Search profiles by free text, newest first, paged.
    pub fn search_profiles(&self, query: &str, page: usize, per_page: usize) -> ProfileSearchResult {
        let st = self.state.read().unwrap();
        let mut matched: HashSet<&str> = HashSet::new();
        for term in text_terms(query) {
            if let Some(keys) = st.terms.get(&term) {
                matched.extend(keys.iter().map(|s| s.as_str()));
            }
        }
        let mut profiles: Vec<Profile> = matched
            .into_iter()
            .filter_map(|pk| st.profiles.get(pk).cloned())
            .collect();
        profiles.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total_count = profiles.len();
        let start = page.saturating_mul(per_page).min(total_count);
        let end = (start + per_page).min(total_count);
        ProfileSearchResult {
            profiles: profiles[start..end].to_vec(),
            total_count,
            page,
            per_page,
        }
    }

    /// Look up one profile by pubkey.
    pub fn get_profile(&self, pubkey: &str) -> Option<Profile> {
        self.state.read().unwrap().profiles.get(pubkey).cloned()
    }

    /// Contacts this pubkey follows, newest first.
    pub fn get_following(&self, pubkey: &str, limit: usize) -> Vec<Contact> {
        let st = self.state.read().unwrap();
        let mut following: Vec<Contact> = st
            .contacts
            .values()
            .filter(|c| c.follower_pubkey == pubkey)
            .cloned()
            .collect();
        following.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        following.truncate(limit);
        following
    }

    /// Contacts following this pubkey, newest first.
    pub fn get_followers(&self, pubkey: &str, limit: usize) -> Vec<Contact> {
        let st = self.state.read().unwrap();
        let mut followers: Vec<Contact> = st
            .contacts
            .values()
            .filter(|c| c.following_pubkey == pubkey)
            .cloned()
            .collect();
        followers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        followers.truncate(limit);
        followers
    }

    pub fn stats(&self) -> IndexerStats {
        let st = self.state.read().unwrap();
        IndexerStats {
            total_profiles: st.profiles.len(),
            total_relationships: st.contacts.len(),
            last_indexed: st.last_indexed,
            search_index_size: st.terms.len(),
        }
    }
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Terms worth indexing from a profile document.
fn profile_search_terms(data: &serde_json::Value) -> Vec<String> {
    let mut terms = Vec::new();
    for field in ["name", "display_name", "about"] {
        if let Some(text) = data.get(field).and_then(|v| v.as_str()) {
            terms.extend(text_terms(text));
        }
    }
    if let Some(nip05) = data.get("nip05").and_then(|v| v.as_str()) {
        terms.push(nip05.to_lowercase());
    }
    terms.sort();
    terms.dedup();
    terms
}

/// Lowercased alphanumeric terms of length > 2.
fn text_terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|word| word.len() > 2)
        .map(|word| {
            word.to_lowercase()
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_string()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

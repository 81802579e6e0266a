use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::query::Query;

struct Pending {
    fingerprint: String,
    expires_at: Instant,
}

/// Outstanding confirmation tokens for held-back destructive writes.
///
/// A token is bound to the exact query that was blocked and can be redeemed once.
pub struct ConfirmationStore {
    ttl: Duration,
    pending: Mutex<HashMap<String, Pending>>,
}

impl std::fmt::Debug for ConfirmationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationStore")
            .field("ttl", &self.ttl)
            .field("pending", &self.len())
            .finish()
    }
}

/// The query as it will be resubmitted: same document, token field ignored.
fn fingerprint(query: &Query) -> String {
    let mut query = query.clone();
    query.confirm_token = None;
    serde_json::to_string(&query).unwrap_or_default()
}

impl ConfirmationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Stores a fresh token for `query` and returns it.
    pub fn issue(&self, query: &Query) -> String {
        let token = format!("confirm_{}", Uuid::new_v4().simple());
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, p| p.expires_at > now);
        pending.insert(
            token.clone(),
            Pending {
                fingerprint: fingerprint(query),
                expires_at: now + self.ttl,
            },
        );
        token
    }

    /// Consumes `token`. True only if it exists, has not expired and was issued for `query`.
    pub fn redeem(&self, token: &str, query: &Query) -> bool {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
        match entry {
            Some(p) => p.expires_at > Instant::now() && p.fingerprint == fingerprint(query),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

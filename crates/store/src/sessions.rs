//! Session store: maps a session id to the variants it has been shown.

use crate::kv::KvStore;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, warn};
use variant_core::key::{session_key, SESSION_REGISTRY_KEY};
use variant_core::types::{SessionDescriptor, ValidatedRequest};
use variant_core::validation::{is_valid_session_id, SESSION_ID_BYTES};
use variant_core::{ExperimentError, ExperimentResult};

/// Attempts at a compare-and-swap write before keeping the in-memory copy.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Cryptographically random, lowercase hex session id.
pub fn mint_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    ttl_secs: Option<u64>,
    max_key_length: usize,
}

impl SessionStore {
    /// A TTL of 0 keeps sessions until the backend evicts them.
    pub fn new(kv: Arc<dyn KvStore>, ttl_secs: u64, max_key_length: usize) -> Self {
        Self {
            kv,
            ttl_secs: (ttl_secs > 0).then_some(ttl_secs),
            max_key_length,
        }
    }

    pub async fn connect(&self) -> ExperimentResult<()> {
        self.kv.connect().await
    }

    pub async fn disconnect(&self) -> ExperimentResult<()> {
        self.kv.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.kv.is_connected()
    }

    /// Loads a registered session by id.
    pub async fn load(&self, session_id: &str) -> ExperimentResult<Option<SessionDescriptor>> {
        if !self.kv.set_contains(SESSION_REGISTRY_KEY, session_id).await? {
            return Ok(None);
        }
        let key = session_key(session_id, self.max_key_length)?;
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session record");
                Ok(None)
            }
        }
    }

    /// Returns the request's session, creating one if it has none.
    ///
    /// A session is only created for a request scoped to a site. When the
    /// backend is unavailable the new session is ephemeral and not persisted.
    pub async fn get_or_create_session(
        &self,
        request: &ValidatedRequest,
    ) -> ExperimentResult<SessionDescriptor> {
        if let Some(session) = &request.session {
            return Ok(session.clone());
        }

        if is_valid_session_id(&request.session_id) && self.kv.is_connected() {
            match self.load(&request.session_id).await {
                Ok(Some(session)) => return Ok(session),
                Ok(None) => debug!("Unknown session id, minting a new one"),
                Err(e) => warn!(error = %e, "Session lookup failed"),
            }
        }

        if request.site_name.is_empty() {
            return Err(ExperimentError::SessionScope);
        }

        if !self.kv.is_connected() {
            warn!(site = %request.site_name, "Session backend unavailable, using ephemeral session");
            metrics::counter!("sessions.ephemeral").increment(1);
            return Ok(SessionDescriptor::new(mint_session_id()));
        }

        match self.create().await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!(error = %e, site = %request.site_name, "Session creation failed, using ephemeral session");
                metrics::counter!("sessions.ephemeral").increment(1);
                Ok(SessionDescriptor::new(mint_session_id()))
            }
        }
    }

    async fn create(&self) -> ExperimentResult<SessionDescriptor> {
        loop {
            let session = SessionDescriptor::new(mint_session_id());
            let key = session_key(&session.session_id, self.max_key_length)?;
            let raw = serde_json::to_string(&session)?;
            if self
                .kv
                .insert_new(&key, &raw, self.ttl_secs, SESSION_REGISTRY_KEY, &session.session_id)
                .await?
            {
                metrics::counter!("sessions.created").increment(1);
                debug!(session_id = %session.session_id, "Session created");
                return Ok(session);
            }
        }
    }

    /// Records that `variant` was shown and persists the session.
    ///
    /// The write is a compare-and-swap against the stored record, re-applied
    /// to the freshest copy on conflict. Persistence failures are logged and
    /// the mutated in-memory session is returned regardless.
    pub async fn mark_variant_seen(
        &self,
        mut session: SessionDescriptor,
        site: &str,
        experiment_id: &str,
        variant: &str,
    ) -> SessionDescriptor {
        if !session.mark_seen(site, experiment_id, variant) {
            return session;
        }
        if !self.kv.is_connected() {
            debug!("Session backend unavailable, selection kept in memory");
            return session;
        }

        match self.persist(&session, site, experiment_id, variant).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!(session_id = %session.session_id, "Session write kept conflicting, giving up");
                session
            }
            Err(e) => {
                warn!(error = %e, session_id = %session.session_id, "Failed to persist session");
                session
            }
        }
    }

    async fn persist(
        &self,
        session: &SessionDescriptor,
        site: &str,
        experiment_id: &str,
        variant: &str,
    ) -> ExperimentResult<Option<SessionDescriptor>> {
        let key = session_key(&session.session_id, self.max_key_length)?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.kv.get(&key).await?;
            let Some(raw) = current else {
                let raw = serde_json::to_string(session)?;
                if self
                    .kv
                    .insert_new(&key, &raw, self.ttl_secs, SESSION_REGISTRY_KEY, &session.session_id)
                    .await?
                {
                    return Ok(Some(session.clone()));
                }
                continue;
            };

            let mut fresh: SessionDescriptor = match serde_json::from_str(&raw) {
                Ok(stored) => stored,
                Err(_) => session.clone(),
            };
            fresh.mark_seen(site, experiment_id, variant);
            let updated = serde_json::to_string(&fresh)?;
            if self
                .kv
                .compare_and_swap(&key, Some(&raw), &updated, self.ttl_secs)
                .await?
            {
                return Ok(Some(fresh));
            }
            metrics::counter!("sessions.cas_conflicts").increment(1);
        }
        Ok(None)
    }
}

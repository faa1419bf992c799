//! Session registry — creation, lookup, hydration, and cross-region
//! resolution.
//!
//! Lookup order: live actor map, then the local store, then (only when asked)
//! the ordered region fallback list. A remote hit is adopted into the local
//! store so the next lookup is local. Misses at every tier surface as
//! `SessionError::NotFound`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::SessionError;

use super::actor::SessionActor;
use super::state::SessionState;
use super::store::SessionStore;

/// Looks up a session snapshot in one remote region.
#[async_trait]
pub trait SessionLocator: Send + Sync {
    fn region(&self) -> &str;

    /// `Ok(None)` means the region does not know the session; errors are
    /// treated the same way so one unreachable region never blocks the scan.
    async fn locate(&self, id: &str) -> Result<Option<SessionState>>;
}

/// Upper bound on one region probe; an unresponsive peer is treated as a
/// miss, never allowed to stall resolution.
const LOCATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Locator backed by a peer deployment's HTTP API.
pub struct HttpLocator {
    region: String,
    base_url: String,
    http: reqwest::Client,
}

impl HttpLocator {
    pub fn new(region: &str, base_url: &str) -> Self {
        Self {
            region: region.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SessionLocator for HttpLocator {
    fn region(&self) -> &str {
        &self.region
    }

    async fn locate(&self, id: &str) -> Result<Option<SessionState>> {
        let url = format!("{}/api/apps/{}/full", self.base_url, id);
        let response = self.http.get(&url).timeout(LOCATE_TIMEOUT).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!(
                "region {} returned status {} for session {}",
                self.region,
                response.status(),
                id
            );
        }
        let state: SessionState = response.json().await?;
        Ok(Some(state))
    }
}

/// Owns the live actor map and the durable store behind it.
pub struct SessionRegistry {
    store: SessionStore,
    actors: Mutex<HashMap<String, Arc<SessionActor>>>,
    locators: Vec<Arc<dyn SessionLocator>>,
}

impl SessionRegistry {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            actors: Mutex::new(HashMap::new()),
            locators: Vec::new(),
        }
    }

    /// Register the ordered region fallback list.
    pub fn with_locators(mut self, locators: Vec<Arc<dyn SessionLocator>>) -> Self {
        self.locators = locators;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Create a fresh uninitialized session and persist its first snapshot.
    pub async fn create(&self, query: &str) -> Result<Arc<SessionActor>, SessionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let state = SessionState::new(&id, query);
        self.store
            .save(state.clone())
            .await
            .map_err(SessionError::Store)?;

        let actor = SessionActor::new(state, self.store.clone());
        self.actors.lock().await.insert(id.clone(), Arc::clone(&actor));
        info!("created session {}", id);
        Ok(actor)
    }

    /// Resolve a session id to its actor, hydrating from the local store if
    /// needed. With `search_across_regions` the ordered locator list is
    /// consulted after a local miss, stopping at the first region that
    /// returns an initialized session.
    pub async fn resolve(
        &self,
        id: &str,
        search_across_regions: bool,
    ) -> Result<Arc<SessionActor>, SessionError> {
        if let Some(actor) = self.actors.lock().await.get(id) {
            return Ok(Arc::clone(actor));
        }

        // Store and region lookups run outside the map lock so a slow
        // probe never stalls resolution of other sessions.
        if let Some(mut state) = self.store.load(id).await.map_err(SessionError::Store)? {
            debug!("hydrated session {} from store", id);
            // The pipeline that set this flag died with its process.
            state.generation_in_flight = false;
            return Ok(self.install(id, state).await);
        }

        if search_across_regions {
            for locator in &self.locators {
                match locator.locate(id).await {
                    Ok(Some(mut state)) if state.is_initialized() => {
                        info!(
                            "adopted session {} from region {}",
                            id,
                            locator.region()
                        );
                        // Any pipeline stays behind in the source region.
                        state.generation_in_flight = false;
                        // Adopt locally so future lookups stop here.
                        self.store
                            .save(state.clone())
                            .await
                            .map_err(SessionError::Store)?;
                        return Ok(self.install(id, state).await);
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(
                            "region {} lookup failed for session {}: {:#}",
                            locator.region(),
                            id,
                            e
                        );
                        continue;
                    }
                }
            }
        }

        Err(SessionError::NotFound { id: id.to_string() })
    }

    /// Insert under the map lock, keeping whichever actor got there first so
    /// two concurrent hydrations never split one session across two writers.
    async fn install(&self, id: &str, state: SessionState) -> Arc<SessionActor> {
        let mut actors = self.actors.lock().await;
        if let Some(existing) = actors.get(id) {
            return Arc::clone(existing);
        }
        let actor = SessionActor::new(state, self.store.clone());
        actors.insert(id.to_string(), Arc::clone(&actor));
        actor
    }

    /// Fork an initialized session under a fresh identity. The fork carries
    /// the blueprint, files, and conversation but starts with no sandbox
    /// binding and nothing in flight.
    pub async fn clone_session(&self, id: &str) -> Result<Arc<SessionActor>, SessionError> {
        let source = self.resolve(id, false).await?;
        let snapshot = source.full_state().await;
        if !snapshot.is_initialized() {
            return Err(SessionError::NotInitialized { id: id.to_string() });
        }

        let new_id = uuid::Uuid::new_v4().to_string();
        let forked = snapshot.clone_for_fork(&new_id);
        self.store
            .save(forked.clone())
            .await
            .map_err(SessionError::Store)?;

        let actor = SessionActor::new(forked, self.store.clone());
        self.actors
            .lock()
            .await
            .insert(new_id.clone(), Arc::clone(&actor));
        info!("forked session {} into {}", id, new_id);
        Ok(actor)
    }

    pub async fn list_ids(&self) -> Result<Vec<String>, SessionError> {
        self.store.list_ids().await.map_err(SessionError::Store)
    }

    /// Drop the live actor and the durable snapshot. Returns whether a
    /// snapshot existed.
    pub async fn delete(&self, id: &str) -> Result<bool, SessionError> {
        self.actors.lock().await.remove(id);
        self.store.delete(id).await.map_err(SessionError::Store)
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::actor::{
    JoinError, SessionHandle, SessionInfo, SpawnOptions, is_valid_language, spawn_session,
};
use super::hub::{Participant, ParticipantId};
use crate::config::{RoomConfig, RunConfig};
use crate::error::SessionError;
use crate::metrics::ServerMetrics;

/// Live sessions by room id
pub type SessionMap = Arc<RwLock<HashMap<String, SessionHandle>>>;

/// A join that keeps landing on sessions in the middle of shutting down
/// gives up after this many tries.
const JOIN_ATTEMPTS: usize = 3;

const MAX_ROOM_ID_LEN: usize = 64;

pub struct SessionRegistry {
    sessions: SessionMap,
    room_config: Arc<RoomConfig>,
    run_config: Arc<RunConfig>,
    metrics: Arc<ServerMetrics>,
}

impl SessionRegistry {
    pub fn new(
        room_config: Arc<RoomConfig>,
        run_config: Arc<RunConfig>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            room_config,
            run_config,
            metrics,
        }
    }

    pub fn room_config(&self) -> &RoomConfig {
        &self.room_config
    }

    /// Admit `participant` to `room_id`, creating the session if needed.
    ///
    /// `language` only matters when this join creates the session.
    pub async fn join(
        &self,
        room_id: &str,
        participant: Participant,
        language: Option<&str>,
    ) -> Result<SessionHandle, SessionError> {
        for attempt in 1..=JOIN_ATTEMPTS {
            let handle = self.get_or_create(room_id, language).await;
            match handle.join(participant.clone()).await {
                Ok(()) => return Ok(handle),
                Err(JoinError::Rejected(err)) => return Err(err),
                Err(JoinError::Closed) => {
                    debug!(room = %room_id, attempt, "Session closed during join, retrying");
                    self.forget(room_id, &handle).await;
                }
            }
        }

        warn!(room = %room_id, "Giving up on join after repeated session shutdowns");
        Err(SessionError::Internal("room kept closing during join".to_string()))
    }

    /// Remove `participant` from `room_id`. Unknown rooms and participants are ignored.
    pub async fn leave(&self, room_id: &str, participant: ParticipantId) {
        let Some(handle) = self.get(room_id).await else {
            return;
        };
        if handle.leave(participant).await.is_err() {
            debug!(room = %room_id, %participant, "Session already gone on leave");
        }
    }

    pub async fn get(&self, room_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(room_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(info) = handle.get_info().await {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        infos
    }

    async fn get_or_create(&self, room_id: &str, language: Option<&str>) -> SessionHandle {
        if let Some(handle) = self.get(room_id).await.filter(|h| !h.is_closed()) {
            return handle;
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(room_id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }

        let language = language
            .filter(|l| is_valid_language(l))
            .unwrap_or(self.room_config.default_language.as_str())
            .to_string();
        info!(room = %room_id, %language, "Creating session");

        let handle = spawn_session(SpawnOptions {
            room_id: room_id.to_string(),
            language,
            room_config: self.room_config.clone(),
            run_config: self.run_config.clone(),
            metrics: self.metrics.clone(),
            sessions: self.sessions.clone(),
        });
        sessions.insert(room_id.to_string(), handle.clone());
        handle
    }

    /// Drop the registry entry for `room_id` if it is still `handle`'s session
    async fn forget(&self, room_id: &str, handle: &SessionHandle) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(room_id)
            .is_some_and(|h| h.instance_id() == handle.instance_id())
        {
            sessions.remove(room_id);
        }
    }
}

/// Room ids are 1-64 characters of `[A-Za-z0-9_-]`
pub fn is_valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

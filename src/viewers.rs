use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{Change, ChangeSender};
use crate::error::AppError;

/// Display names are cut to this many characters
pub const MAX_NAME_CHARS: usize = 30;

/// Minimum spacing between two chat messages from one session
pub const CHAT_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum spacing between two auth attempts from one session
pub const AUTH_INTERVAL: Duration = Duration::from_secs(5);

const GUEST_PREFIX: &str = "guest#";

#[derive(Debug)]
struct SessionData {
    name: String,
    watching: bool,
    last_chat: Option<Instant>,
    last_auth: Option<Instant>,
    identity: Option<String>,
}

/// One connected viewer
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    ip: IpAddr,
    outbound: mpsc::Sender<String>,
    data: Mutex<SessionData>,
}

impl Session {
    fn new(name: String, ip: IpAddr, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip,
            outbound,
            data: Mutex::new(SessionData {
                name,
                watching: false,
                last_chat: None,
                last_auth: None,
                identity: None,
            }),
        }
    }

    // Only ever held for field copies; a poisoned lock still holds usable data.
    fn data(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn name(&self) -> String {
        self.data().name.clone()
    }

    pub fn watching(&self) -> bool {
        self.data().watching
    }

    /// Identity token set by the auth step
    pub fn identity(&self) -> Option<String> {
        self.data().identity.clone()
    }

    pub fn set_identity(&self, identity: impl Into<String>) {
        self.data().identity = Some(identity.into());
    }

    /// Record a chat attempt at `now`; false if the last one was too recent
    pub fn admit_chat(&self, now: Instant) -> bool {
        admit(&mut self.data().last_chat, now, CHAT_INTERVAL)
    }

    /// Record an auth attempt at `now`; false if the last one was too recent
    pub fn admit_auth(&self, now: Instant) -> bool {
        admit(&mut self.data().last_auth, now, AUTH_INTERVAL)
    }

    /// Queue a frame for this connection without waiting
    pub fn send(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send to viewer {} (buffer full or closed): {}", self.id, e);
                false
            }
        }
    }
}

fn admit(last: &mut Option<Instant>, now: Instant, interval: Duration) -> bool {
    if let Some(previous) = *last {
        if now.saturating_duration_since(previous) < interval {
            return false;
        }
    }
    *last = Some(now);
    true
}

/// Trim and bound a requested display name
pub fn normalize_name(requested: &str) -> Result<String, AppError> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Name cannot be empty".to_string()));
    }
    Ok(trimmed.chars().take(MAX_NAME_CHARS).collect())
}

/// Live viewers keyed by display name
pub struct ViewerRegistry {
    viewers: RwLock<HashMap<String, Arc<Session>>>,
    next_id: AtomicU64,
    changes: ChangeSender,
}

impl ViewerRegistry {
    pub fn new(changes: ChangeSender) -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            changes,
        }
    }

    fn next_guest_name(&self) -> String {
        format!("{}{}", GUEST_PREFIX, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a new connection under a fresh anonymous name
    pub async fn register(&self, ip: IpAddr, outbound: mpsc::Sender<String>) -> Arc<Session> {
        let session = {
            let mut viewers = self.viewers.write().await;
            // Someone may have renamed themselves into a future guest slot
            let name = loop {
                let candidate = self.next_guest_name();
                if !viewers.contains_key(&candidate) {
                    break candidate;
                }
                debug!("Guest name {} already taken, generating another", candidate);
            };

            let session = Arc::new(Session::new(name.clone(), ip, outbound));
            viewers.insert(name, session.clone());
            session
        };

        info!("Viewer {} connected from {} as '{}'", session.id(), ip, session.name());
        let _ = self.changes.send(Change::Viewers);
        session
    }

    /// Move `session` to a new name; returns the old one.
    ///
    /// Fails without touching the registry if the name is already registered.
    pub async fn rename(&self, session: &Session, requested: &str) -> Result<String, AppError> {
        let name = normalize_name(requested)?;

        let old = {
            let mut viewers = self.viewers.write().await;
            if viewers.contains_key(&name) {
                return Err(AppError::NameInUse);
            }

            let old = session.name();
            let entry = viewers
                .remove(&old)
                .ok_or_else(|| AppError::UnknownViewer(old.clone()))?;
            session.data().name = name.clone();
            viewers.insert(name.clone(), entry);
            old
        };

        info!("'{}' changed their name to '{}'", old, name);
        let _ = self.changes.send(Change::Viewers);
        Ok(old)
    }

    /// Drop a disconnected session; false if it was not registered
    pub async fn remove(&self, session: &Session) -> bool {
        let removed = {
            let mut viewers = self.viewers.write().await;
            let name = session.name();
            match viewers.get(&name) {
                Some(existing) if existing.id() == session.id() => {
                    viewers.remove(&name);
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!("Viewer '{}' disconnected", session.name());
            let _ = self.changes.send(Change::Viewers);
        }
        removed
    }

    pub async fn set_watching(&self, session: &Session, watching: bool) {
        session.data().watching = watching;
        let _ = self.changes.send(Change::Viewers);
    }

    pub async fn find(&self, name: &str) -> Option<Arc<Session>> {
        self.viewers.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.viewers.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.viewers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.viewers.read().await.is_empty()
    }

    /// Watching flag of every registered viewer
    pub async fn watching_map(&self) -> BTreeMap<String, bool> {
        self.viewers
            .read()
            .await
            .iter()
            .map(|(name, session)| (name.clone(), session.watching()))
            .collect()
    }

    /// Queue one pre-serialized frame for every viewer
    pub async fn broadcast(&self, frame: &str) {
        let viewers = self.viewers.read().await;
        for session in viewers.values() {
            session.send(frame.to_string());
        }
    }
}

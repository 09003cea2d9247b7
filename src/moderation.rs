//! Roles and bans, backed by the persisted configuration file.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::{AppConfig, ConfigManager};

#[derive(Error, Debug)]
pub enum ModerationError {
    #[error("Already a mod")]
    AlreadyMod,

    #[error("Not a mod")]
    NotMod,

    #[error("Already banned")]
    AlreadyBanned,

    #[error("Not banned")]
    NotBanned,

    #[error("IP already banned")]
    IpAlreadyBanned,

    #[error("IP not banned")]
    IpNotBanned,

    #[error("Change applied but could not be saved: {0:#}")]
    Persist(anyhow::Error),
}

/// Label attached to chat messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Mod,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Mod => "mod",
            Role::User => "user",
        }
    }
}

fn is_master_in(config: &AppConfig, identity: Option<&str>) -> bool {
    config.is_open() || identity.is_some_and(|id| id == config.master)
}

fn is_mod_in(config: &AppConfig, identity: Option<&str>) -> bool {
    is_master_in(config, identity) || identity.is_some_and(|id| config.mods.iter().any(|m| m == id))
}

/// Permission checks and ban lists over the shared configuration
pub struct ModerationStore {
    config: Arc<RwLock<AppConfig>>,
    path: PathBuf,
}

impl ModerationStore {
    pub fn new(config: Arc<RwLock<AppConfig>>, path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            path: path.into(),
        }
    }

    /// Share the manager's configuration so hot reloads are seen immediately
    pub fn from_manager(manager: &ConfigManager) -> Self {
        Self::new(manager.get_config_arc(), manager.get_config_path())
    }

    pub async fn is_master(&self, identity: Option<&str>) -> bool {
        is_master_in(&*self.config.read().await, identity)
    }

    pub async fn is_mod(&self, identity: Option<&str>) -> bool {
        is_mod_in(&*self.config.read().await, identity)
    }

    pub async fn role(&self, identity: Option<&str>) -> Role {
        let config = self.config.read().await;
        if is_master_in(&config, identity) {
            Role::Master
        } else if is_mod_in(&config, identity) {
            Role::Mod
        } else {
            Role::User
        }
    }

    /// Whether either the identity or the connection address is banned
    pub async fn is_banned(&self, identity: Option<&str>, ip: IpAddr) -> bool {
        let config = self.config.read().await;
        let ip = ip.to_string();
        identity.is_some_and(|id| config.bans.iter().any(|b| b == id)) || config.ip_bans.iter().any(|b| *b == ip)
    }

    pub async fn add_mod(&self, id: &str) -> Result<(), ModerationError> {
        self.update(|config| {
            if config.mods.iter().any(|m| m == id) {
                return Err(ModerationError::AlreadyMod);
            }
            config.mods.push(id.to_string());
            Ok(())
        })
        .await?;
        info!("Added mod [{}]", id);
        Ok(())
    }

    pub async fn remove_mod(&self, id: &str) -> Result<(), ModerationError> {
        self.update(|config| remove_entry(&mut config.mods, id, ModerationError::NotMod))
            .await?;
        info!("Removed mod [{}]", id);
        Ok(())
    }

    pub async fn ban_user(&self, id: &str) -> Result<(), ModerationError> {
        self.update(|config| {
            if config.bans.iter().any(|b| b == id) {
                return Err(ModerationError::AlreadyBanned);
            }
            config.bans.push(id.to_string());
            Ok(())
        })
        .await?;
        info!("Banned [{}]", id);
        Ok(())
    }

    pub async fn unban_user(&self, id: &str) -> Result<(), ModerationError> {
        self.update(|config| remove_entry(&mut config.bans, id, ModerationError::NotBanned))
            .await?;
        info!("Unbanned [{}]", id);
        Ok(())
    }

    pub async fn ban_ip(&self, ip: IpAddr) -> Result<(), ModerationError> {
        let ip = ip.to_string();
        self.update(|config| {
            if config.ip_bans.contains(&ip) {
                return Err(ModerationError::IpAlreadyBanned);
            }
            config.ip_bans.push(ip.clone());
            Ok(())
        })
        .await?;
        info!("Banned ip {}", ip);
        Ok(())
    }

    pub async fn unban_ip(&self, ip: IpAddr) -> Result<(), ModerationError> {
        let ip = ip.to_string();
        self.update(|config| remove_entry(&mut config.ip_bans, &ip, ModerationError::IpNotBanned))
            .await?;
        info!("Unbanned ip {}", ip);
        Ok(())
    }

    pub async fn snapshot(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Mutate under the write lock, then save while still holding it.
    ///
    /// A failed precondition writes nothing. A failed save keeps the in-memory change.
    /// The file write runs on the blocking pool so the runtime keeps serving.
    async fn update<F>(&self, mutate: F) -> Result<(), ModerationError>
    where
        F: FnOnce(&mut AppConfig) -> Result<(), ModerationError>,
    {
        let mut config = self.config.write().await;
        mutate(&mut config)?;

        let snapshot = config.clone();
        let path = self.path.clone();
        let saved = tokio::task::spawn_blocking(move || snapshot.save_to_file(&path))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|result| result);

        saved.map_err(|e| {
            error!("Failed to persist moderation change to {}: {:#}", self.path.display(), e);
            ModerationError::Persist(e)
        })
    }
}

fn remove_entry(list: &mut Vec<String>, value: &str, missing: ModerationError) -> Result<(), ModerationError> {
    match list.iter().position(|entry| entry == value) {
        Some(index) => {
            list.remove(index);
            Ok(())
        }
        None => Err(missing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn store_with(config: AppConfig) -> (TempDir, ModerationStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        config.save_to_file(&path).unwrap();
        let store = ModerationStore::new(Arc::new(RwLock::new(config)), path);
        (dir, store)
    }

    fn owned() -> AppConfig {
        AppConfig {
            master: "owner".to_string(),
            mods: vec!["helper".to_string()],
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn test_open_master_grants_everything() {
        let (_dir, store) = store_with(AppConfig::default());
        assert!(store.is_master(None).await);
        assert!(store.is_mod(Some("anyone")).await);
        assert_eq!(store.role(None).await, Role::Master);
    }

    #[tokio::test]
    async fn test_roles() {
        let (_dir, store) = store_with(owned());
        assert_eq!(store.role(Some("owner")).await, Role::Master);
        assert_eq!(store.role(Some("helper")).await, Role::Mod);
        assert_eq!(store.role(Some("someone")).await, Role::User);
        assert_eq!(store.role(None).await, Role::User);
        assert!(store.is_mod(Some("owner")).await);
        assert!(!store.is_master(Some("helper")).await);
    }

    #[tokio::test]
    async fn test_bans_by_id_and_ip() {
        let (_dir, store) = store_with(owned());
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

        assert!(!store.is_banned(Some("troll"), ip).await);
        store.ban_user("troll").await.unwrap();
        assert!(store.is_banned(Some("troll"), IpAddr::V4(Ipv4Addr::LOCALHOST)).await);
        assert!(matches!(store.ban_user("troll").await, Err(ModerationError::AlreadyBanned)));

        store.ban_ip(ip).await.unwrap();
        assert!(store.is_banned(None, ip).await);
        store.unban_ip(ip).await.unwrap();
        assert!(!store.is_banned(None, ip).await);
        assert!(matches!(store.unban_ip(ip).await, Err(ModerationError::IpNotBanned)));
    }

    #[tokio::test]
    async fn test_mutations_are_persisted() {
        let (dir, store) = store_with(owned());
        store.ban_user("troll").await.unwrap();
        store.add_mod("friend").await.unwrap();

        let on_disk = AppConfig::load_from_file(dir.path().join("config.json")).unwrap();
        assert_eq!(on_disk.bans, vec!["troll".to_string()]);
        assert_eq!(on_disk.mods, vec!["helper".to_string(), "friend".to_string()]);
    }

    #[tokio::test]
    async fn test_mod_round_trip() {
        let (dir, store) = store_with(owned());
        let path = dir.path().join("config.json");
        let original = store.snapshot().await.mods;

        store.add_mod("friend").await.unwrap();
        assert!(AppConfig::load_from_file(&path).unwrap().mods.contains(&"friend".to_string()));
        store.remove_mod("friend").await.unwrap();
        assert_eq!(store.snapshot().await.mods, original);
        assert_eq!(AppConfig::load_from_file(&path).unwrap().mods, original);

        // A failed precondition must not touch the file
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(store.remove_mod("nobody").await, Err(ModerationError::NotMod)));
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_changes_are_all_saved() {
        let (dir, store) = store_with(owned());
        let store = Arc::new(store);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.ban_user(&format!("troll-{}", i)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let on_disk = AppConfig::load_from_file(dir.path().join("config.json")).unwrap();
        assert_eq!(on_disk.bans.len(), 8);
        assert_eq!(on_disk, store.snapshot().await);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_change() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be written as a file
        let store = ModerationStore::new(Arc::new(RwLock::new(owned())), dir.path());

        let err = store.add_mod("friend").await.unwrap_err();
        assert!(matches!(err, ModerationError::Persist(_)));
        assert!(store.is_mod(Some("friend")).await);
    }
}

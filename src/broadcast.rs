//! Change events and the fan-out of state snapshots to every viewer.
//!
//! The engine and the registry only announce *what* changed on a [`Change`] channel.
//! A single [`Broadcaster`] subscriber turns those announcements into snapshot frames.

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::PlaybackEngine;
use crate::error::AppError;
use crate::protocol::{self, ChatMessage, EventCode, Notification, StatusReply};
use crate::viewers::ViewerRegistry;

const CHANGE_CAPACITY: usize = 64;

/// Which part of the shared state changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Playlist,
    Status,
    Settings,
    Viewers,
}

pub type ChangeSender = broadcast::Sender<Change>;

pub fn change_channel() -> (ChangeSender, broadcast::Receiver<Change>) {
    broadcast::channel(CHANGE_CAPACITY)
}

/// Copy the status fields, engine lock first and registry second
pub async fn status_snapshot(engine: &PlaybackEngine, registry: &ViewerRegistry) -> StatusReply {
    let state = engine.lock_state().await;
    let viewers = registry.watching_map().await;
    StatusReply {
        timestamp: state.elapsed(Instant::now()).as_secs(),
        action: state.action(),
        viewer_count: viewers.len(),
        viewers,
        playing: state.playing,
    }
}

pub async fn status_frame(engine: &PlaybackEngine, registry: &ViewerRegistry) -> Result<String, AppError> {
    let status = status_snapshot(engine, registry).await;
    Ok(protocol::encode(EventCode::Status, &status)?)
}

pub async fn playlist_frame(engine: &PlaybackEngine) -> Result<String, AppError> {
    let playlist = engine.playlist().await;
    Ok(protocol::encode(EventCode::Playlist, &playlist)?)
}

pub async fn settings_frame(engine: &PlaybackEngine) -> Result<String, AppError> {
    let settings = engine.settings().await;
    Ok(protocol::encode(EventCode::Settings, &settings)?)
}

pub fn notification_frame(msg: impl Into<String>, bypass: bool) -> Result<String, AppError> {
    let notification = Notification { msg: msg.into(), bypass };
    Ok(protocol::encode(EventCode::Notification, &notification)?)
}

/// Pushes snapshots and announcements to every registered viewer
#[derive(Clone)]
pub struct Broadcaster {
    engine: PlaybackEngine,
    registry: Arc<ViewerRegistry>,
}

impl Broadcaster {
    pub fn new(engine: PlaybackEngine, registry: Arc<ViewerRegistry>) -> Self {
        Self { engine, registry }
    }

    pub async fn status(&self) -> Result<(), AppError> {
        let frame = status_frame(&self.engine, &self.registry).await?;
        self.registry.broadcast(&frame).await;
        Ok(())
    }

    pub async fn playlist(&self) -> Result<(), AppError> {
        let frame = playlist_frame(&self.engine).await?;
        self.registry.broadcast(&frame).await;
        Ok(())
    }

    pub async fn settings(&self) -> Result<(), AppError> {
        let frame = settings_frame(&self.engine).await?;
        self.registry.broadcast(&frame).await;
        Ok(())
    }

    pub async fn notify(&self, msg: impl Into<String>, bypass: bool) -> Result<(), AppError> {
        let frame = notification_frame(msg, bypass)?;
        self.registry.broadcast(&frame).await;
        Ok(())
    }

    pub async fn chat(&self, message: &ChatMessage) -> Result<(), AppError> {
        let frame = protocol::encode(EventCode::ChatMessage, message)?;
        self.registry.broadcast(&frame).await;
        Ok(())
    }

    async fn publish(&self, change: Change) -> Result<(), AppError> {
        match change {
            Change::Playlist => {
                self.playlist().await?;
                self.status().await
            }
            Change::Settings => self.settings().await,
            Change::Status | Change::Viewers => self.status().await,
        }
    }

    async fn publish_all(&self) -> Result<(), AppError> {
        self.playlist().await?;
        self.settings().await?;
        self.status().await
    }

    /// Turn change events into broadcasts until every sender is gone
    pub async fn run(self, mut changes: broadcast::Receiver<Change>) {
        info!("Broadcaster started");
        loop {
            let result = match changes.recv().await {
                Ok(change) => {
                    debug!("Broadcasting {:?} change", change);
                    self.publish(change).await
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Broadcaster lagged by {} changes, sending full snapshot", skipped);
                    self.publish_all().await
                }
                Err(RecvError::Closed) => break,
            };

            if let Err(e) = result {
                warn!("Broadcast failed: {}", e);
            }
        }
        info!("Broadcaster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PlaybackAction;
    use crate::transcoder::{EncodeJob, EncodeOutcome, Encoder};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct IdleEncoder;

    #[async_trait]
    impl Encoder for IdleEncoder {
        async fn encode(&self, _job: &EncodeJob, _stop: CancellationToken) -> anyhow::Result<EncodeOutcome> {
            Ok(EncodeOutcome::Completed)
        }
    }

    fn parts() -> (PlaybackEngine, Arc<ViewerRegistry>) {
        let (changes, _) = change_channel();
        let engine = PlaybackEngine::spawn(Arc::new(IdleEncoder), changes.clone());
        let registry = Arc::new(ViewerRegistry::new(changes));
        (engine, registry)
    }

    #[tokio::test]
    async fn test_status_snapshot_when_idle() {
        let (engine, registry) = parts();
        let (tx, _rx) = mpsc::channel(8);
        registry.register(IpAddr::V4(Ipv4Addr::LOCALHOST), tx).await;

        let status = status_snapshot(&engine, &registry).await;
        assert_eq!(status.timestamp, 0);
        assert_eq!(status.action, PlaybackAction::Finished);
        assert_eq!(status.viewer_count, 1);
        assert!(!status.playing);
    }

    #[tokio::test]
    async fn test_broadcast_notification_and_playlist() {
        let (engine, registry) = parts();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(IpAddr::V4(Ipv4Addr::LOCALHOST), tx).await;
        let broadcaster = Broadcaster::new(engine, registry);

        broadcaster.notify("guest#0 pressed play", false).await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["evt"], 20);
        assert_eq!(frame["data"]["msg"], "guest#0 pressed play");
        assert_eq!(frame["data"]["bypass"], false);

        broadcaster.playlist().await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["evt"], 2);
        assert_eq!(frame["data"]["currentIndex"], 0);
        assert!(frame["data"]["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_turns_changes_into_frames() {
        let (changes, _) = change_channel();
        let engine = PlaybackEngine::spawn(Arc::new(IdleEncoder), changes.clone());
        let registry = Arc::new(ViewerRegistry::new(changes.clone()));
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(IpAddr::V4(Ipv4Addr::LOCALHOST), tx).await;

        // Subscribe after the join so only the settings change is queued
        let receiver = changes.subscribe();
        tokio::spawn(Broadcaster::new(engine, registry).run(receiver));
        changes.send(Change::Settings).unwrap();

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["evt"], 8);
        assert_eq!(frame["data"]["preset"], "veryfast");
    }
}

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod moderation;
pub mod playlist;
pub mod protocol;
pub mod transcoder;
pub mod viewers;
pub mod web;

pub mod state {
    use crate::{
        broadcast::{change_channel, Broadcaster, Change},
        config::ConfigManager,
        engine::PlaybackEngine,
        moderation::ModerationStore,
        transcoder::Encoder,
        viewers::ViewerRegistry,
    };
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    #[derive(Clone)]
    pub struct AppState {
        pub engine: PlaybackEngine,
        pub registry: Arc<ViewerRegistry>,
        pub moderation: Arc<ModerationStore>,
        pub broadcaster: Broadcaster,
        pub config: Arc<ConfigManager>,
        /// `--playlist` given on the command line, wins over the config file
        pub playlist_override: Option<String>,
        pub segment_dir: PathBuf,
    }

    impl AppState {
        /// Wire up the shared components. The returned receiver feeds [`Broadcaster::run`].
        pub fn build(
            config: Arc<ConfigManager>,
            encoder: Arc<dyn Encoder>,
            playlist_override: Option<String>,
            segment_dir: PathBuf,
        ) -> (Self, broadcast::Receiver<Change>) {
            let (changes, receiver) = change_channel();
            let engine = PlaybackEngine::spawn(encoder, changes.clone());
            let registry = Arc::new(ViewerRegistry::new(changes));
            let moderation = Arc::new(ModerationStore::from_manager(&config));
            let broadcaster = Broadcaster::new(engine.clone(), registry.clone());

            let state = Self {
                engine,
                registry,
                moderation,
                broadcaster,
                config,
                playlist_override,
                segment_dir,
            };
            (state, receiver)
        }

        /// Playlist file used at startup and by reload requests
        pub async fn playlist_path(&self) -> Option<String> {
            match &self.playlist_override {
                Some(path) => Some(path.clone()),
                None => self.config.get_config().await.playlist_path,
            }
        }
    }
}

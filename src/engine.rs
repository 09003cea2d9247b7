//! Shared playback state machine.
//!
//! One [`PlaybackEngine`] owns the playlist, the encoder settings and the play head.
//! Two kinds of long-lived tasks act on it:
//!
//! - the monitor task, the only consumer of the command channel, applies
//!   Stop/Next/Prev one at a time and never waits on the encoder;
//! - the playback task, spawned by [`PlaybackEngine::play`], walks the playlist and
//!   blocks on one encoder run at a time.
//!
//! All state sits behind a single mutex that is released before any encoder call.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Change, ChangeSender};
use crate::clock::format_location;
use crate::error::AppError;
use crate::playlist::{Playlist, PlaylistItem};
use crate::transcoder::{validate_preset, EncodeJob, EncodeOutcome, Encoder, TranscoderSettings};

/// Each run gets this many segment numbers to itself
pub const SEGMENT_STRIDE: u64 = 1000;

/// Resume this far before the point where playback was stopped
pub const RESUME_REWIND: Duration = Duration::from_secs(3);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Already playing")]
    AlreadyPlaying,

    #[error("Not playing anything at the moment")]
    NotPlaying,

    #[error("Playback engine is not running")]
    Stopped,
}

/// Playback control delivered through the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    Next,
    Prev,
}

/// Status label shown to viewers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackAction {
    Playing,
    /// Stopped by an operator
    Paused,
    /// Ran out of media
    Finished,
}

/// Seek setting to resume from after a manual stop `elapsed` into an item
pub fn resume_seek(elapsed: Duration) -> String {
    elapsed
        .checked_sub(RESUME_REWIND)
        .map(|d| d.as_secs())
        .filter(|secs| *secs > 0)
        .map(format_location)
        .unwrap_or_default()
}

#[derive(Debug)]
pub struct EngineState {
    pub playlist: Playlist,
    pub settings: TranscoderSettings,
    pub playing: bool,
    /// The last stop came from an operator rather than the end of the media
    pub manual_stop: bool,
    pub started_at: Option<Instant>,
    pub stopped_at: Option<Instant>,
    segment_base: u64,
    /// Interrupt handle of the encoder run in flight
    process: Option<CancellationToken>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            playlist: Playlist::default(),
            settings: TranscoderSettings::default(),
            playing: false,
            manual_stop: false,
            started_at: None,
            stopped_at: None,
            segment_base: 0,
            process: None,
        }
    }

    /// Hand out the next disjoint block of segment numbers
    fn allocate_segment_base(&mut self) -> u64 {
        let base = self.segment_base;
        self.segment_base += SEGMENT_STRIDE;
        base
    }

    /// Interrupt the running encoder; false if there is none yet
    fn interrupt(&self) -> bool {
        match &self.process {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Position within the current item
    pub fn elapsed(&self, now: Instant) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        if self.playing {
            now.saturating_duration_since(started)
        } else {
            self.stopped_at
                .map(|stopped| stopped.saturating_duration_since(started))
                .unwrap_or_default()
        }
    }

    pub fn action(&self) -> PlaybackAction {
        if self.playing {
            PlaybackAction::Playing
        } else if self.manual_stop {
            PlaybackAction::Paused
        } else {
            PlaybackAction::Finished
        }
    }

    /// Apply one control command. Never blocks.
    fn apply(&mut self, command: Command) {
        match command {
            Command::Stop => {
                if self.playing && self.interrupt() {
                    self.manual_stop = true;
                }
            }
            Command::Next => {
                self.settings.seek.clear();
                if self.playing {
                    // The playback task advances once the run ends
                    self.interrupt();
                } else {
                    self.playlist.current_index += 1;
                }
            }
            Command::Prev => {
                self.settings.seek.clear();
                if self.playing {
                    // Two back, the playback task then steps one forward
                    self.playlist.current_index -= 2;
                    self.interrupt();
                } else {
                    self.playlist.current_index -= 1;
                }
            }
        }
    }
}

struct Shared {
    state: Mutex<EngineState>,
    encoder: Arc<dyn Encoder>,
    changes: ChangeSender,
}

impl Shared {
    fn notify(&self, change: Change) {
        let _ = self.changes.send(change);
    }
}

/// Handle to the playback engine; clones share one engine
#[derive(Clone)]
pub struct PlaybackEngine {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PlaybackEngine {
    /// Create the engine and spawn its monitor task
    pub fn spawn(encoder: Arc<dyn Encoder>, changes: ChangeSender) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState::new()),
            encoder,
            changes,
        });
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(monitor(shared.clone(), receiver));

        Self { shared, commands }
    }

    /// Lock the engine state. Callers must not hold the guard across I/O.
    pub async fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.shared.state.lock().await
    }

    /// Queue a control command for the monitor task
    pub fn command(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::Stopped)
    }

    /// Start playing from the current index
    pub async fn play(&self) -> Result<(), EngineError> {
        {
            let mut state = self.shared.state.lock().await;
            if state.playing {
                debug!("Ignoring play request, already playing");
                return Err(EngineError::AlreadyPlaying);
            }
            state.playing = true;
        }

        tokio::spawn(supervise_playlist(self.shared.clone()));
        Ok(())
    }

    /// Play the item at `index`, or resume when `index` is negative.
    ///
    /// While playing, the running item is cut short and playback continues at `index`.
    pub async fn play_index(&self, index: i64) -> Result<(), EngineError> {
        if index < 0 {
            return self.play().await;
        }

        {
            let mut state = self.shared.state.lock().await;
            if state.playing {
                state.playlist.current_index = index - 1;
                self.command(Command::Next)?;
                return Ok(());
            }
            state.playlist.current_index = index;
            state.playing = true;
        }

        self.shared.notify(Change::Playlist);
        tokio::spawn(supervise_playlist(self.shared.clone()));
        Ok(())
    }

    /// Stop the running item and remember where to resume
    pub async fn pause(&self) -> Result<(), EngineError> {
        let state = self.shared.state.lock().await;
        if !state.playing {
            return Err(EngineError::NotPlaying);
        }
        self.command(Command::Stop)
    }

    /// Stop playback and wait up to `grace` for the engine to go idle.
    ///
    /// Returns false if the encoder was still running when the wait ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if !self.is_playing().await {
            return true;
        }
        if let Err(e) = self.command(Command::Stop) {
            warn!("Failed to stop playback: {}", e);
        }

        let idle = tokio::time::timeout(grace, async {
            while self.is_playing().await {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        idle.is_ok()
    }

    pub async fn add_item(&self, item: PlaylistItem) {
        info!("Appending {} to the playlist", item.path);
        self.shared.state.lock().await.playlist.items.push(item);
        self.shared.notify(Change::Playlist);
    }

    /// Empty the playlist. A running item keeps playing.
    pub async fn clear_playlist(&self) {
        self.shared.state.lock().await.playlist.items.clear();
        self.shared.notify(Change::Playlist);
    }

    /// Swap in a freshly loaded list of items, keeping the play head
    pub async fn replace_items(&self, items: Vec<PlaylistItem>) {
        self.shared.state.lock().await.playlist.items = items;
        self.shared.notify(Change::Playlist);
    }

    /// Replace the encoder settings wholesale
    pub async fn set_settings(&self, settings: TranscoderSettings) -> Result<(), AppError> {
        validate_preset(&settings.preset)?;
        info!(
            "Transcoder settings changed (preset {}, subtitles {})",
            settings.preset,
            if settings.subs { "enabled" } else { "disabled" }
        );
        self.shared.state.lock().await.settings = settings;
        self.shared.notify(Change::Settings);
        Ok(())
    }

    pub async fn playlist(&self) -> Playlist {
        self.shared.state.lock().await.playlist.clone()
    }

    pub async fn settings(&self) -> TranscoderSettings {
        self.shared.state.lock().await.settings.clone()
    }

    pub async fn is_playing(&self) -> bool {
        self.shared.state.lock().await.playing
    }

    pub async fn current_index(&self) -> i64 {
        self.shared.state.lock().await.playlist.current_index
    }
}

async fn monitor(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    info!("Playback monitor started");
    while let Some(command) = commands.recv().await {
        debug!("Applying playback command {:?}", command);
        shared.state.lock().await.apply(command);
        shared.notify(Change::Playlist);
    }
    info!("Playback monitor stopped");
}

/// Check that `path` names a regular file
async fn validate_media_path(path: &str) -> Result<(), String> {
    let metadata = tokio::fs::metadata(Path::new(path))
        .await
        .map_err(|e| format!("cannot open file: {}", e))?;
    if metadata.is_dir() {
        return Err("path is a directory".to_string());
    }
    Ok(())
}

/// Run the playback task and put the engine back to idle if it dies early
async fn supervise_playlist(shared: Arc<Shared>) {
    let run = tokio::spawn(run_playlist(shared.clone()));
    if let Err(e) = run.await {
        error!("Playback task ended abnormally: {}", e);
        let mut state = shared.state.lock().await;
        state.playing = false;
        state.process = None;
        drop(state);
        shared.notify(Change::Playlist);
    }
}

/// Playback task: runs items until the end of the playlist or a manual stop
async fn run_playlist(shared: Arc<Shared>) {
    loop {
        let (item, segment_base) = {
            let mut state = shared.state.lock().await;
            state.manual_stop = false;

            if state.playlist.current_index >= state.playlist.len() {
                info!("Reached the end of the playlist");
                state.playlist.current_index = 0;
                state.playing = false;
                drop(state);
                shared.notify(Change::Playlist);
                return;
            }
            if state.playlist.current_index < 0 {
                state.playlist.current_index = 0;
            }

            let base = state.allocate_segment_base();
            let index = state.playlist.current_index as usize;
            (state.playlist.items[index].clone(), base)
        };

        if let Err(reason) = validate_media_path(&item.path).await {
            warn!("Skipping {}: {}", item.path, reason);
            shared.state.lock().await.playlist.current_index += 1;
            shared.notify(Change::Playlist);
            continue;
        }

        let outcome = play_item(&shared, &item, None, segment_base).await;
        if outcome == EncodeOutcome::SubtitlesUnavailable {
            info!("No subtitle track in {}, retrying without subtitles", item.path);
            play_item(&shared, &item, Some(false), segment_base).await;
        }

        let mut state = shared.state.lock().await;
        state.settings.seek.clear();
        let now = Instant::now();
        state.stopped_at = Some(now);

        if state.manual_stop {
            let elapsed = state
                .started_at
                .map(|started| now.saturating_duration_since(started))
                .unwrap_or_default();
            state.settings.seek = resume_seek(elapsed);
            state.playing = false;
            info!("Playback stopped, resume point '{}'", state.settings.seek);
            drop(state);
            shared.notify(Change::Settings);
            shared.notify(Change::Playlist);
            return;
        }

        state.playlist.current_index += 1;
        drop(state);
        shared.notify(Change::Playlist);
    }
}

/// One encoder run for `item`. `subtitles` overrides the subtitle setting when set.
async fn play_item(
    shared: &Shared,
    item: &PlaylistItem,
    subtitles: Option<bool>,
    segment_base: u64,
) -> EncodeOutcome {
    let stop = CancellationToken::new();

    let job = {
        let mut state = shared.state.lock().await;
        let settings = state.settings.clone();
        let job = EncodeJob {
            item: item.clone(),
            subtitles: subtitles.unwrap_or(settings.subs),
            settings,
            segment_base,
        };

        // Seeking skips ahead, so playback is that far in already
        let now = Instant::now();
        let offset = Duration::from_secs(job.seek_seconds());
        state.started_at = Some(now.checked_sub(offset).unwrap_or(now));
        state.process = Some(stop.clone());
        job
    };
    shared.notify(Change::Status);

    let outcome = match shared.encoder.encode(&job, stop).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Encoder run for {} failed: {:#}", item.path, e);
            EncodeOutcome::Failed(None)
        }
    };

    shared.state.lock().await.process = None;

    if let EncodeOutcome::Failed(code) = outcome {
        warn!(
            "Encoder exited with failure ({:?}) for {}, treating it as the end of the item",
            code, item.path
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(items: usize, index: i64, playing: bool) -> EngineState {
        let mut state = EngineState::new();
        state.playlist.items = (0..items)
            .map(|i| PlaylistItem::movie(format!("/m/{}.mp4", i)))
            .collect();
        state.playlist.current_index = index;
        state.playing = playing;
        state
    }

    #[test]
    fn test_resume_seek() {
        assert_eq!(resume_seek(Duration::from_secs(0)), "");
        assert_eq!(resume_seek(Duration::from_secs(3)), "");
        assert_eq!(resume_seek(Duration::from_millis(3900)), "");
        assert_eq!(resume_seek(Duration::from_secs(4)), "0:0:1");
        assert_eq!(resume_seek(Duration::from_secs(3603)), "1:0:0");
    }

    #[test]
    fn test_segment_bases_are_disjoint() {
        let mut state = EngineState::new();
        assert_eq!(state.allocate_segment_base(), 0);
        assert_eq!(state.allocate_segment_base(), 1000);
        assert_eq!(state.allocate_segment_base(), 2000);
    }

    #[test]
    fn test_commands_while_idle_move_index() {
        let mut state = state_with(3, 1, false);
        state.settings.seek = "0:1:0".into();

        state.apply(Command::Next);
        assert_eq!(state.playlist.current_index, 2);
        assert!(state.settings.seek.is_empty());

        state.apply(Command::Prev);
        state.apply(Command::Prev);
        assert_eq!(state.playlist.current_index, 0);

        state.apply(Command::Stop);
        assert!(!state.manual_stop);
    }

    #[test]
    fn test_prev_while_playing_compensates() {
        let mut state = state_with(5, 3, true);
        let token = CancellationToken::new();
        state.process = Some(token.clone());

        state.apply(Command::Prev);
        assert_eq!(state.playlist.current_index, 1);
        assert!(token.is_cancelled());
        assert!(!state.manual_stop);
    }

    #[test]
    fn test_stop_without_process_is_noop() {
        let mut state = state_with(2, 0, true);
        state.apply(Command::Stop);
        assert!(!state.manual_stop);

        let token = CancellationToken::new();
        state.process = Some(token.clone());
        state.apply(Command::Stop);
        assert!(state.manual_stop);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_action_labels() {
        let mut state = state_with(1, 0, true);
        assert_eq!(state.action(), PlaybackAction::Playing);
        state.playing = false;
        state.manual_stop = true;
        assert_eq!(state.action(), PlaybackAction::Paused);
        state.manual_stop = false;
        assert_eq!(state.action(), PlaybackAction::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed() {
        let mut state = state_with(1, 0, true);
        let start = Instant::now();
        state.started_at = Some(start);
        assert_eq!(state.elapsed(start + Duration::from_secs(7)), Duration::from_secs(7));

        state.playing = false;
        state.stopped_at = Some(start + Duration::from_secs(12));
        assert_eq!(state.elapsed(start + Duration::from_secs(100)), Duration::from_secs(12));
    }
}

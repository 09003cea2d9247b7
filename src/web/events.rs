//! Handlers for client events, one call per inbound frame.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broadcast::{self, notification_frame};
use crate::engine::Command;
use crate::error::AppError;
use crate::playlist::{load_playlist_file, PlaylistItem};
use crate::protocol::{
    self, ChatCommand, ChatMessage, Envelope, ErrorReply, EventCode, PlayRequest, SetNameData, WatchingStatusUpdate,
};
use crate::state::AppState;
use crate::transcoder::TranscoderSettings;
use crate::viewers::Session;

/// Longest accepted chat message, in characters
pub const MAX_CHAT_CHARS: usize = 1000;

/// Decode a payload; a missing payload decodes like an empty object
fn decode<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, AppError> {
    let data = if data.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        data
    };
    Ok(serde_json::from_value(data)?)
}

fn reply<T: Serialize>(session: &Session, evt: EventCode, data: &T) -> Result<(), AppError> {
    session.send(protocol::encode(evt, data)?);
    Ok(())
}

fn notify_one(session: &Session, msg: impl Into<String>) -> Result<(), AppError> {
    session.send(notification_frame(msg, true)?);
    Ok(())
}

/// Tell the viewer why their request failed
pub fn report(session: &Session, err: &AppError) {
    let frame = if err.is_notification() {
        notification_frame(err.to_string(), true)
    } else {
        protocol::encode(EventCode::Error, &ErrorReply { error: err.to_string() }).map_err(AppError::from)
    };

    match frame {
        Ok(frame) => {
            session.send(frame);
        }
        Err(e) => warn!("Failed to encode error reply for {}: {}", session.id(), e),
    }
}

async fn require_master(state: &AppState, session: &Session) -> Result<(), AppError> {
    if state.moderation.is_master(session.identity().as_deref()).await {
        Ok(())
    } else {
        Err(AppError::PermissionDenied("You're not an admin".to_string()))
    }
}

async fn require_mod(state: &AppState, session: &Session) -> Result<(), AppError> {
    if state.moderation.is_mod(session.identity().as_deref()).await {
        Ok(())
    } else {
        Err(AppError::PermissionDenied("You're not a mod".to_string()))
    }
}

/// Initial frames for a fresh connection, then announce it to everyone
pub async fn on_connect(state: &AppState, session: &Session) -> Result<(), AppError> {
    session.send(broadcast::playlist_frame(&state.engine).await?);
    session.send(broadcast::settings_frame(&state.engine).await?);
    reply(
        session,
        EventCode::SetName,
        &SetNameData {
            name: session.name(),
            old: String::new(),
        },
    )?;
    notify_one(session, format!("Connected to cinesync {}!", env!("CARGO_PKG_VERSION")))?;
    state.broadcaster.notify(format!("{} joined", session.name()), false).await
}

/// Drop the session and announce the departure
pub async fn on_disconnect(state: &AppState, session: &Session) -> Result<(), AppError> {
    if state.registry.remove(session).await {
        state.broadcaster.notify(format!("{} left", session.name()), false).await?;
    }
    Ok(())
}

/// Decode and dispatch one text frame, reporting any failure to the sender
pub async fn handle_frame(state: AppState, session: Arc<Session>, text: String) {
    let result = match serde_json::from_str::<Envelope>(&text) {
        Ok(envelope) => dispatch(&state, &session, envelope).await,
        Err(e) => Err(AppError::Json(e)),
    };

    if let Err(e) = result {
        debug!("Request from '{}' failed: {}", session.name(), e);
        report(&session, &e);
    }
}

pub async fn dispatch(state: &AppState, session: &Session, envelope: Envelope) -> Result<(), AppError> {
    let evt = EventCode::try_from(envelope.evt)
        .map_err(|code| AppError::Validation(format!("Unknown event {}", code)))?;
    let data = envelope.data;
    debug!("Handling {:?} from '{}'", evt, session.name());

    match evt {
        EventCode::SetName => set_name(state, session, decode(data)?).await,
        EventCode::Playlist => {
            session.send(broadcast::playlist_frame(&state.engine).await?);
            Ok(())
        }
        EventCode::Status => {
            session.send(broadcast::status_frame(&state.engine, &state.registry).await?);
            Ok(())
        }
        EventCode::Settings => {
            session.send(broadcast::settings_frame(&state.engine).await?);
            Ok(())
        }
        EventCode::PlaylistAdd => playlist_add(state, session, decode(data)?).await,
        EventCode::SetSettings => set_settings(state, session, decode(data)?).await,
        EventCode::Play => play(state, session, decode(data)?).await,
        EventCode::Pause => pause(state, session).await,
        EventCode::Next => control(state, session, Command::Next, "next").await,
        EventCode::Prev => control(state, session, Command::Prev, "previous").await,
        EventCode::PlaylistClear => playlist_clear(state, session).await,
        EventCode::WatchingStateChange => watching(state, session, decode(data)?).await,
        EventCode::ChatMessage => chat(state, session, decode(data)?).await,
        EventCode::Auth => auth(session, decode(data)?),
        EventCode::ChatCmd => chat_command(state, session, decode(data)?).await,
        EventCode::ReloadPlaylist => reload_playlist(state, session).await,
        EventCode::Notification | EventCode::Error => {
            debug!("Ignoring server-only event {:?} from '{}'", evt, session.name());
            Ok(())
        }
    }
}

async fn set_name(state: &AppState, session: &Session, request: SetNameData) -> Result<(), AppError> {
    let old = state.registry.rename(session, &request.name).await?;
    let name = session.name();
    reply(
        session,
        EventCode::SetName,
        &SetNameData {
            name: name.clone(),
            old: old.clone(),
        },
    )?;
    state
        .broadcaster
        .notify(format!("{} changed their name to {}", old, name), false)
        .await
}

async fn playlist_add(state: &AppState, session: &Session, item: PlaylistItem) -> Result<(), AppError> {
    require_master(state, session).await?;
    let title = item.title.clone();
    state.engine.add_item(item).await;
    state
        .broadcaster
        .notify(format!("{} added {} to the playlist", session.name(), title), true)
        .await
}

async fn set_settings(state: &AppState, session: &Session, settings: TranscoderSettings) -> Result<(), AppError> {
    require_master(state, session).await?;
    state.engine.set_settings(settings).await?;
    state
        .broadcaster
        .notify(format!("{} changed the transcoder settings", session.name()), true)
        .await
}

async fn play(state: &AppState, session: &Session, request: PlayRequest) -> Result<(), AppError> {
    require_master(state, session).await?;
    state.engine.play_index(request.index).await?;
    state
        .broadcaster
        .notify(format!("{} pressed play", session.name()), true)
        .await
}

async fn pause(state: &AppState, session: &Session) -> Result<(), AppError> {
    require_master(state, session).await?;
    state.engine.pause().await?;
    state
        .broadcaster
        .notify(format!("{} pressed pause", session.name()), true)
        .await
}

async fn control(state: &AppState, session: &Session, command: Command, label: &str) -> Result<(), AppError> {
    require_master(state, session).await?;
    state.engine.command(command)?;
    state
        .broadcaster
        .notify(format!("{} pressed {}", session.name(), label), true)
        .await
}

async fn playlist_clear(state: &AppState, session: &Session) -> Result<(), AppError> {
    require_master(state, session).await?;
    state.engine.clear_playlist().await;
    state
        .broadcaster
        .notify(format!("{} cleared the playlist", session.name()), true)
        .await
}

async fn watching(state: &AppState, session: &Session, update: WatchingStatusUpdate) -> Result<(), AppError> {
    state.registry.set_watching(session, update.watching).await;
    let label = if update.watching { "watching" } else { "not watching" };
    state
        .broadcaster
        .notify(format!("{} changed state to: {}", session.name(), label), false)
        .await
}

async fn chat(state: &AppState, session: &Session, message: ChatMessage) -> Result<(), AppError> {
    let identity = session
        .identity()
        .ok_or_else(|| AppError::PermissionDenied("You need to log in before chatting".to_string()))?;

    if state.moderation.is_banned(Some(&identity), session.ip()).await {
        return Err(AppError::Banned);
    }
    if message.msg.chars().count() > MAX_CHAT_CHARS {
        return Err(AppError::MessageTooLong(MAX_CHAT_CHARS));
    }
    if !session.admit_chat(Instant::now()) {
        return Err(AppError::RateLimited(
            "You can send a maximum of 1 chat message per 0.5 second".to_string(),
        ));
    }

    let role = state.moderation.role(Some(&identity)).await;
    let outgoing = ChatMessage {
        msg: message.msg,
        from: session.name(),
        kind: role.as_str().to_string(),
    };
    info!(
        "Chat msg {{{}}}[{}][{}]'{}': {}",
        session.ip(),
        identity,
        outgoing.kind,
        outgoing.from,
        outgoing.msg
    );
    state.broadcaster.chat(&outgoing).await
}

fn auth(session: &Session, key: String) -> Result<(), AppError> {
    if !session.admit_auth(Instant::now()) {
        return Err(AppError::RateLimited("Maximum 1 login try every 5 seconds".to_string()));
    }
    if key.trim().is_empty() {
        return Err(AppError::Validation("Key cannot be empty".to_string()));
    }

    info!("Viewer '{}' authenticated", session.name());
    session.set_identity(key);
    Ok(())
}

async fn chat_command(state: &AppState, session: &Session, command: ChatCommand) -> Result<(), AppError> {
    let target = state
        .registry
        .find(&command.target)
        .await
        .ok_or_else(|| AppError::UnknownViewer(command.target.clone()))?;
    let target_id = target
        .identity()
        .ok_or_else(|| AppError::NoIdentity(command.target.clone()))?;

    let moderation = &state.moderation;
    let actor = session.identity();
    let confirmation = match command.cmd.as_str() {
        "/mod" => {
            require_master(state, session).await?;
            moderation.add_mod(&target_id).await?;
            format!("Added mod {}", command.target)
        }
        "/demod" => {
            require_master(state, session).await?;
            moderation.remove_mod(&target_id).await?;
            format!("Removed mod {}", command.target)
        }
        "/ban" => {
            require_mod(state, session).await?;
            if moderation.is_mod(Some(&target_id)).await && !moderation.is_master(actor.as_deref()).await {
                return Err(AppError::PermissionDenied("Cannot ban other mods".to_string()));
            }
            moderation.ban_user(&target_id).await?;
            format!("Banned user {}", command.target)
        }
        "/unban" => {
            require_mod(state, session).await?;
            moderation.unban_user(&target_id).await?;
            format!("Unbanned user {}", command.target)
        }
        "/ipban" => {
            require_mod(state, session).await?;
            moderation.ban_ip(target.ip()).await?;
            format!("Banned ip of {}", command.target)
        }
        "/ipunban" => {
            require_mod(state, session).await?;
            moderation.unban_ip(target.ip()).await?;
            format!("Unbanned ip of {}", command.target)
        }
        other => return Err(AppError::Validation(format!("Unknown command {}", other))),
    };

    info!(
        "{{{}}}[{}] '{}' {} '{}' [{}]",
        target.ip(),
        actor.as_deref().unwrap_or("-"),
        session.name(),
        command.cmd,
        command.target,
        target_id
    );
    notify_one(session, confirmation)
}

async fn reload_playlist(state: &AppState, session: &Session) -> Result<(), AppError> {
    require_master(state, session).await?;
    let path = state
        .playlist_path()
        .await
        .ok_or_else(|| AppError::Validation("No playlist file configured".to_string()))?;

    let items = load_playlist_file(&path).map_err(|e| AppError::Validation(format!("{:#}", e)))?;
    state.engine.replace_items(items).await;
    state
        .broadcaster
        .notify(format!("{} reloaded the playlist", session.name()), true)
        .await
}

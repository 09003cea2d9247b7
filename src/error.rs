use axum::{
    http::{Error as HttpError, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::engine::EngineError;
use crate::moderation::ModerationError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Name already in use")]
    NameInUse,

    #[error("{0}")]
    PermissionDenied(String),

    #[error("You're banned from the chat")]
    Banned,

    #[error("{0}")]
    RateLimited(String),

    #[error("couldn't find user '{0}'")]
    UnknownViewer(String),

    #[error("User has no id '{0}'")]
    NoIdentity(String),

    #[error("Too long chat message, cant be longer than {0} characters")]
    MessageTooLong(usize),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Moderation(#[from] ModerationError),

    #[error("Not Found")]
    NotFound,

    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Failures reported to the viewer as a notification rather than an error event
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            AppError::PermissionDenied(_)
                | AppError::Banned
                | AppError::RateLimited(_)
                | AppError::UnknownViewer(_)
                | AppError::NoIdentity(_)
                | AppError::MessageTooLong(_)
                | AppError::Moderation(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::Json(_) | AppError::MessageTooLong(_) => StatusCode::BAD_REQUEST,
            AppError::PermissionDenied(_) | AppError::Banned => StatusCode::FORBIDDEN,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::NameInUse | AppError::Engine(_) => StatusCode::CONFLICT,
            AppError::UnknownViewer(_) | AppError::NoIdentity(_) => StatusCode::NOT_FOUND,
            AppError::Moderation(_)
            | AppError::Internal(_)
            | AppError::Io(_)
            | AppError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_classification() {
        assert!(AppError::Banned.is_notification());
        assert!(AppError::PermissionDenied("You're not a mod".into()).is_notification());
        assert!(AppError::Moderation(ModerationError::NotMod).is_notification());
        assert!(!AppError::NameInUse.is_notification());
        assert!(!AppError::Validation("bad".into()).is_notification());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::NotFound.into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Engine(EngineError::AlreadyPlaying).into_response().status(),
            StatusCode::CONFLICT
        );
    }
}

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::AgentError;

/// Domain error rendered as a JSON `{error}` body
#[derive(Debug)]
pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(error: AgentError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AgentError::RegistrationFailed(_) => StatusCode::BAD_REQUEST,

            AgentError::SessionNotFound
            | AgentError::SessionExpired
            | AgentError::InvalidCredentials(_)
            | AgentError::ChallengeExpired
            | AgentError::ChallengeMismatch
            | AgentError::SignCountReplay { .. } => StatusCode::UNAUTHORIZED,

            AgentError::CredentialNotFound(_)
            | AgentError::BucketNotFound(_)
            | AgentError::KeyNotFound { .. }
            | AgentError::ModuleNotFound(_)
            | AgentError::ActionNotFound { .. } => StatusCode::NOT_FOUND,

            AgentError::ModuleAlreadyLoaded(_) | AgentError::ModuleDisabled(_) => StatusCode::CONFLICT,

            AgentError::Storage(_)
            | AgentError::Serialization(_)
            | AgentError::ModuleInitialization { .. }
            | AgentError::ActionFailed { .. }
            | AgentError::Timeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else if self.0.is_auth_failure() {
            tracing::warn!(status = status.as_u16(), "Authentication rejected: {}", self.0);
        } else {
            tracing::debug!(status = status.as_u16(), "Request rejected: {}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn replay_is_unauthorized() {
        let response = ApiError(AgentError::SignCountReplay { stored: 5, received: 5 }).into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_of(response).await;
        assert!(body.contains("\"error\""));
        assert!(body.contains("replay"));
    }

    #[tokio::test]
    async fn unknown_credential_is_not_found() {
        let response = ApiError(AgentError::CredentialNotFound("u1".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn status_mapping_covers_each_class() {
        assert_eq!(
            ApiError(AgentError::RegistrationFailed("bad".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(AgentError::ModuleAlreadyLoaded("kv".to_string())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(AgentError::ActionFailed {
                module: "m".to_string(),
                action: "a".to_string(),
                reason: "r".to_string(),
            })
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use branchforge_chain::ChainError;
use branchforge_crypto::CipherError;
use branchforge_storage::StoreError;
use branchforge_supervisor::SupervisorError;
use branchforge_workspace::WorkspaceError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("MASTER_KEY is not configured; secrets are unavailable")]
    MasterKeyMissing,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl ControllerError {
    /// Transient chain failures are not application errors: the agent row
    /// must not be marked `error` because of one.
    pub fn is_transient_chain(&self) -> bool {
        matches!(self, ControllerError::Chain(err) if err.is_transient())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ControllerError::Validation(_) => StatusCode::BAD_REQUEST,
            ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
            ControllerError::Chain(ChainError::Transient(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

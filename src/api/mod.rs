pub mod client;
pub mod signing;
pub mod worker;

pub use client::ControlPlaneClient;
pub use signing::SigningIdentity;
pub use worker::{CredentialBundle, JobControlApi, ScratchCompletion, WorkerApiClient};

pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Control-plane call failures. Transport problems are kept distinct from
/// protocol-level rejections so callers can tell a flaky network from a
/// rejected request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport failure calling {url}: {reason}")]
    Transport { url: String, reason: String },
    #[error("authorization rejected ({status}): {body}")]
    Authorization { status: u16, body: String },
    #[error("resource not found: {resource}")]
    NotFound { resource: String },
    #[error("bad request: {body}")]
    BadRequest { body: String },
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("signing failed: {0}")]
    Signing(#[from] signing::SigningError),
}

/// Maps a response status class to the protocol error taxonomy.
/// 2xx never reaches this function.
pub fn error_for_status(status: u16, body: String, url: &str, resource: &str) -> ApiError {
    match status {
        401 | 403 => ApiError::Authorization { status, body },
        404 => ApiError::NotFound {
            resource: resource.to_string(),
        },
        400 => ApiError::BadRequest { body },
        500..=599 => ApiError::Server { status, body },
        _ => ApiError::UnexpectedStatus {
            status,
            url: url.to_string(),
        },
    }
}

pub(crate) fn map_ureq_error(err: ureq::Error, url: &str, resource: &str) -> ApiError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            error_for_status(status, body, url, resource)
        }
        ureq::Error::Transport(transport) => ApiError::Transport {
            url: url.to_string(),
            reason: transport.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes_map_to_taxonomy() {
        assert!(matches!(
            error_for_status(401, String::new(), "u", "job 1"),
            ApiError::Authorization { status: 401, .. }
        ));
        assert!(matches!(
            error_for_status(403, String::new(), "u", "job 1"),
            ApiError::Authorization { status: 403, .. }
        ));
        assert!(matches!(
            error_for_status(404, String::new(), "u", "job 1"),
            ApiError::NotFound { .. }
        ));
        assert!(matches!(
            error_for_status(400, "oops".to_string(), "u", "job 1"),
            ApiError::BadRequest { .. }
        ));
        assert!(matches!(
            error_for_status(503, String::new(), "u", "job 1"),
            ApiError::Server { status: 503, .. }
        ));
        assert!(matches!(
            error_for_status(302, String::new(), "u", "job 1"),
            ApiError::UnexpectedStatus { status: 302, .. }
        ));
    }
}

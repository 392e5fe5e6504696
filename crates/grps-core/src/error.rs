//! Error taxonomy shared by the runtime and both transport surfaces.

use thiserror::Error;

use crate::conf::ConfError;

/// Every failure the serving core can surface to a client or to the
/// bootstrap. The transports map kinds onto HTTP status codes and in-band
/// RPC statuses; the predict path never panics across a request boundary.
#[derive(Debug, Error)]
pub enum GrpsError {
    /// Configuration document violated a rule. Fatal before listening.
    #[error(transparent)]
    Config(#[from] ConfError),

    /// An inferer refused to load its model. Fatal before listening.
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// Unparseable body, wrong content type or missing required field.
    #[error("{0}")]
    BadRequest(String),

    /// Unknown model name on a metadata lookup or pipeline bypass.
    #[error("{0}")]
    NotFound(String),

    /// The readiness latch is off.
    #[error("Service Unavailable")]
    Unavailable,

    /// Anything that failed inside predict: converter, inferer or pipeline.
    #[error("{0}")]
    Internal(String),
}

impl GrpsError {
    /// HTTP status code carried by this error on the REST surface.
    pub fn http_code(&self) -> u16 {
        match self {
            GrpsError::Config(_) | GrpsError::ModelLoad(_) | GrpsError::Internal(_) => 500,
            GrpsError::BadRequest(_) => 400,
            GrpsError::NotFound(_) => 404,
            GrpsError::Unavailable => 503,
        }
    }

    /// Whether this error looks like a GPU out-of-memory condition. Drives
    /// the `*gpu_oom_count` counter. Inferers that detect OOM deliberately
    /// surface it through their error text.
    pub fn oom_like(&self) -> bool {
        let text = self.to_string();
        text.contains("CUDA out of memory") || text.contains("OOM")
    }

    /// Internal error wrapping any displayable cause.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        GrpsError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(GrpsError::BadRequest("x".into()).http_code(), 400);
        assert_eq!(GrpsError::NotFound("x".into()).http_code(), 404);
        assert_eq!(GrpsError::Unavailable.http_code(), 503);
        assert_eq!(GrpsError::Internal("x".into()).http_code(), 500);
    }

    #[test]
    fn oom_detection() {
        assert!(GrpsError::Internal("CUDA out of memory: tried to allocate".into()).oom_like());
        assert!(GrpsError::Internal("tf OOM when allocating tensor".into()).oom_like());
        assert!(!GrpsError::Internal("shape mismatch".into()).oom_like());
    }
}

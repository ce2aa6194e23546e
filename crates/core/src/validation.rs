//! Front door that turns collaborator-extracted request parts into a
//! [`ValidatedRequest`].

use crate::config::ValidationConfig;
use crate::error::{ExperimentError, ExperimentResult};
use crate::types::ValidatedRequest;
use tracing::debug;

/// Random bytes in a session id; the id is their lowercase hex encoding.
pub const SESSION_ID_BYTES: usize = 32;

pub const SESSION_ID_LENGTH: usize = SESSION_ID_BYTES * 2;

/// Request parts as extracted by a transport adapter.
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    pub origin: Option<String>,
    pub session_id: Option<String>,
    pub site_name: Option<String>,
}

pub fn is_valid_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_LENGTH
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub struct RequestValidator {
    allowed_origins: Vec<String>,
    require_session: bool,
}

impl RequestValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            require_session: config.require_session,
        }
    }

    fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*") {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|o| o == origin),
            None => false,
        }
    }

    /// Every failure maps to the same [`ExperimentError::Rejected`].
    pub fn validate(&self, parts: RequestParts) -> ExperimentResult<ValidatedRequest> {
        if !self.origin_allowed(parts.origin.as_deref()) {
            debug!(origin = ?parts.origin, "Origin not in allow-list");
            return Err(ExperimentError::Rejected);
        }

        let session_id = parts
            .session_id
            .filter(|id| is_valid_session_id(id))
            .unwrap_or_default();
        if self.require_session && session_id.is_empty() {
            debug!("Request lacks a well-formed session id");
            return Err(ExperimentError::Rejected);
        }

        Ok(ValidatedRequest {
            session_id,
            origin: parts.origin,
            site_name: parts.site_name.unwrap_or_default(),
            session: None,
        })
    }
}

//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Index of an edge connection within the pool.
///
/// Indexes are dense (0..N-1) and stay fixed for the lifetime of a handle.
/// An index is only reused after the handle holding it has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnIndex(pub u8);

impl std::fmt::Display for ConnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Label value used for status codes outside the standard HTTP set.
pub const OTHER_STATUS_LABEL: &str = "other";

/// Status reported when the origin never produced a response.
pub const BAD_GATEWAY: u16 = 502;

/// HTTP status code as used in `*_by_code` metric labels.
///
/// Only codes with a registered reason phrase get their own series; everything
/// else collapses into [`OTHER_STATUS_LABEL`] so a misbehaving origin cannot
/// grow label cardinality without bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(u16);

impl ResponseCode {
    pub fn new(code: u16) -> Self {
        Self(code)
    }

    pub fn code(&self) -> u16 {
        self.0
    }

    /// Whether this code belongs to the standard HTTP status set.
    pub fn is_standard(&self) -> bool {
        StatusCode::from_u16(self.0)
            .ok()
            .and_then(|s| s.canonical_reason())
            .is_some()
    }

    /// Metric label for this code.
    pub fn label(&self) -> String {
        if self.is_standard() {
            self.0.to_string()
        } else {
            OTHER_STATUS_LABEL.to_string()
        }
    }
}

impl From<u16> for ResponseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Byte-producing sources
//
// A Source is whatever currently produces a channel's MPEG-TS bytes: a
// transcoder over resolved media, or the synthetic error screen. Building a
// command is pure; spawning always goes through the process pool.

pub mod builder;
pub mod error_screen;

use serde::{Deserialize, Serialize};

use crate::provider::ResolveError;

pub use builder::{build_command, TranscodeCommand};
pub use error_screen::{AudioMode, ErrorScreenConfig, VisualMode};

/// How a source failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFailureKind {
    /// Worth restarting the same item (under the governor).
    Transient,
    /// The item is unplayable; advance the timeline instead of restarting.
    PermanentForItem,
    /// The backing source is unusable for a cooldown window; advance.
    PermanentForSource,
}

/// Classified source failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("source failed ({kind:?}): {message}")]
pub struct SourceError {
    pub kind: SourceFailureKind,
    pub message: String,
}

impl SourceError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: SourceFailureKind::Transient, message: message.into() }
    }

    #[must_use]
    pub fn permanent_for_item(message: impl Into<String>) -> Self {
        Self { kind: SourceFailureKind::PermanentForItem, message: message.into() }
    }

    #[must_use]
    pub fn permanent_for_source(message: impl Into<String>) -> Self {
        Self { kind: SourceFailureKind::PermanentForSource, message: message.into() }
    }
}

impl From<ResolveError> for SourceError {
    fn from(err: ResolveError) -> Self {
        match &err {
            // AuthExpired surviving the resolver's single refresh attempt
            // behaves like any other permanent-for-item failure.
            ResolveError::NotFound(_)
            | ResolveError::AuthExpired(_)
            | ResolveError::Ambiguous(_) => Self::permanent_for_item(err.to_string()),
            ResolveError::Unreachable(_) => Self::permanent_for_source(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_errors_classify_onto_source_taxonomy() {
        let e: SourceError = ResolveError::NotFound("x".into()).into();
        assert_eq!(e.kind, SourceFailureKind::PermanentForItem);

        let e: SourceError = ResolveError::Unreachable("y".into()).into();
        assert_eq!(e.kind, SourceFailureKind::PermanentForSource);
    }
}

// Resolver Error Types

/// Classified media resolution failures.
///
/// `AuthExpired` entitles the caller to exactly one refresh attempt; all
/// other variants behave as permanent for the item being resolved.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Media not found: {0}")]
    NotFound(String),

    #[error("Authentication expired for {0}")]
    AuthExpired(String),

    #[error("Source unreachable: {0}")]
    Unreachable(String),

    #[error("Ambiguous media reference: {0}")]
    Ambiguous(String),
}

impl ResolveError {
    /// Map a transport error onto the resolve taxonomy.
    pub fn from_http(kind: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            match status.as_u16() {
                401 | 403 => return Self::AuthExpired(kind.to_string()),
                404 | 410 => return Self::NotFound(kind.to_string()),
                _ => {}
            }
        }
        Self::Unreachable(format!("{kind}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ResolveError>;

use ulid::Ulid;

#[derive(Debug)]
pub enum StoreError {
    /// Malformed input. Field-level, never worth retrying.
    Validation(&'static str),
    /// Referenced business/service/appointment is missing.
    NotFound { kind: &'static str, id: Ulid },
    AlreadyExists(Ulid),
    /// Slot taken. Carries the ids of the appointments in the way; the caller
    /// should re-query availability, not retry the same request.
    Conflict(Vec<Ulid>),
    /// Closed day or outside open hours, with a human-readable reason.
    Unavailable(String),
    /// Optimistic lock miss. The caller should re-fetch and retry the change.
    StaleVersion { expected: u32, actual: u32 },
    LimitExceeded(&'static str),
    /// Durability failure. Safe to retry with backoff.
    Wal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Validation(msg) => write!(f, "validation: {msg}"),
            StoreError::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::Conflict(ids) => {
                write!(f, "slot no longer available; conflicts with {ids:?}")
            }
            StoreError::Unavailable(reason) => write!(f, "business unavailable: {reason}"),
            StoreError::StaleVersion { expected, actual } => {
                write!(f, "stale version: expected {expected}, stored {actual}")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

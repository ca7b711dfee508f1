#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("connection closed")]
    Closed,
}

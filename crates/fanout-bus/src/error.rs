#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    Publish(String),
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),
    #[error("bus lease operation failed: {0}")]
    Lease(String),
}

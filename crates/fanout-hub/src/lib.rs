//! Connection Hub: session registry, local fan-out, and the Cluster Bridge
//! that extends fan-out across a shared Bus.

mod bridge;
mod callbacks;
mod config;
mod error;
mod hub;
mod session;

pub use bridge::ClusterBridge;
pub use callbacks::{HubCallbacks, NoopCallbacks};
pub use config::HubOptions;
pub use error::SessionError;
pub use hub::Hub;
pub use session::{run_session, Session, SessionId, SessionQueue};

pub mod config;
pub mod error;
pub mod jid;
pub mod maintenance;
pub mod manager;
pub mod reconnect;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;
pub mod webhook;

pub use config::Config;
pub use error::{Result, SessionError};
pub use manager::{CreateSessionOptions, CreateSessionOutcome, SessionManager};
pub use store::MessageStore;

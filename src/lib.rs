#![forbid(unsafe_code)]
//! Bidirectional streaming sessions over a CLI subprocess that speaks
//! line-delimited JSON on stdio.

pub mod config;
pub mod errors;
pub mod facade;
pub mod models;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::SessionConfig;
pub use errors::{AppError, Result};
pub use facade::{close_session, get_session_id, send_message, start_session, TurnStream};
pub use models::event::DomainEvent;
pub use models::state::SessionState;
pub use session::{SessionHandle, Subscription};

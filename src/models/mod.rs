//! Domain model types shared by the session and its callers.

pub mod event;
pub mod state;

//! Classroom relay library
//!
//! Exposes the relay components for use in integration tests.

mod connection;
mod state;

pub use connection::{handle_connection, Session};
pub use state::{RelayState, ACCESS_TOKEN_ENV};

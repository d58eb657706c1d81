//! Fast-Path / Strong-Path request-reply layer.

pub mod protocol;
pub mod server;

pub use protocol::*;
pub use server::{serve, FastPathConfig, FastPathServer};

//! Shared types for tether

pub mod error;

pub use error::{Result, TetherError};

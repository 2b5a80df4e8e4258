//! Shared types for the BillMate24 session workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

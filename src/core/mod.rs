//! Foundational and often-reused types.

pub(crate) mod clock;
pub mod config;
pub mod error;
pub(crate) mod id;
pub mod message;
pub mod ring;
pub(crate) mod traits;

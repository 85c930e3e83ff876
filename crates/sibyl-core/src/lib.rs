//! Core config, errors, and pipe primitives for Sibyl.

pub mod config;
pub mod error;
pub mod pipe;

pub use error::{Result, SibylError};

//! Shared building blocks for the liveroom realtime server
//!
//! Configuration, logging bootstrap, the error taxonomy, identity and
//! engagement models, token verification and the engagement usecases.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};

#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

pub mod cache;
pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod service;
pub mod sources;
pub mod status;
pub mod viewers;
pub mod web_server;

pub use error::{OurError, OurResult};

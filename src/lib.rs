pub mod api;
pub mod checkpoint;
pub mod config;
pub mod controls;
pub mod error;
pub mod ingestion;
pub mod observability;
pub mod pipeline;
pub mod store;
pub mod types;
pub mod unify;
pub mod utils;

pub use error::{Error, Result};

//! SQLite replica store, read-only catalog and paced HTTP fetch utilities.

mod catalog;
mod http;
mod store;

use thiserror::Error;

pub use catalog::{Catalog, DocumentCriteria, DEFAULT_PREVIEW_CHARS, DEFAULT_PREVIEW_FRAGMENTS};
pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, Pacer};
pub use store::Store;

pub const CRATE_NAME: &str = "lexrep-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored json is not decodable: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

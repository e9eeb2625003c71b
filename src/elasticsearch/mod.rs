//! Elasticsearch client and operations.

mod bulk;
mod client;
mod schema;

pub use bulk::{bulk_body, parse_bulk_response};
pub use client::EsClient;
pub use schema::index_body;

//! Authenticated scraping of listing portals and mail attachment selection.

pub mod anti_detection;
pub mod attachments;
pub mod config;
pub mod enrich;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod models;
pub mod monitoring;
pub mod orchestrator;
pub mod outbound;
pub mod output;
pub mod parser;
pub mod query;
pub mod schema;
pub mod session;

pub use error::ScoutError;
pub use models::{Credentials, NormalizedRecord, RunOutcome, RunRequest};
pub use orchestrator::{Orchestrator, RunState};

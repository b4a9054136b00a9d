//! Review harvester for open pull, merge, and change requests.
//!
//! The library fetches open reviews from GitHub, GitLab, Pagure, Gerrit,
//! and Phabricator, normalizes them into one record shape, filters them
//! by age and comment freshness, and renders the result for the console,
//! an SMTP relay, or IRC channels.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod output;
pub mod review;
pub mod services;

pub use config::{Cli, FileConfig, GitServiceConfig, Settings};
pub use error::HarvestError;
pub use review::{LastComment, Review, ServiceKind};

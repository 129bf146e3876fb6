//! Remote model registry (CivitAI) integration.
//!
//! - [`CivitaiClient`] issues rate-limited lookup-by-hash requests
//! - [`Resolver`] retries transient failures and merges answers into the store
//! - [`RegistryLookup`] is the seam for alternative registries and tests

mod client;
mod resolver;
mod retry;
mod types;

pub use client::{CivitaiClient, RegistryLookup};
pub use resolver::{ResolveOutcome, Resolver};
pub use retry::{retry_async, RetryConfig, RetryStats};
pub use types::{parse_version_payload, LookupOutcome, RemoteModel};

//! Project → backend routing.
//!
//! The SSH core asks one question: which backend hosts project `p`?  The
//! [`Resolver`] trait is that question; [`http::HttpResolver`] asks the
//! platform API and [`table::StaticResolver`] answers from configuration.

pub mod http;
pub mod table;

use std::sync::Arc;

use thiserror::Error;

use crate::config::ResolverConfig;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A resolved destination for one channel.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub project: String,
    /// `host:port` of the backend's SSH endpoint.  Never shown to clients.
    pub address: String,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The resolver answered, and no such project exists.
    #[error("project `{0}` not found")]
    NotFound(String),
    /// The resolver could not answer.
    #[error("route lookup failed: {0:#}")]
    Internal(anyhow::Error),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Maps a project name to the SSH address of the backend hosting it.
///
/// Implementations must be safe to call concurrently from every channel.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, project: &str) -> Result<String, ResolveError>;

    /// Cheap reachability probe used by `/healthz`.
    async fn check(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the configured [`Resolver`].
pub fn build_resolver(config: &ResolverConfig) -> anyhow::Result<Arc<dyn Resolver>> {
    Ok(match config {
        ResolverConfig::Http(http) => Arc::new(http::HttpResolver::new(http)?),
        ResolverConfig::Static(table) => Arc::new(table::StaticResolver::new(table.routes.clone())),
    })
}

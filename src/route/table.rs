//! Static routing table loaded from configuration.

use std::collections::HashMap;

use anyhow::ensure;
use tracing::debug;

use super::{ResolveError, Resolver};

/// Resolver backed by a fixed `project → address` map.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    routes: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(routes: HashMap<String, String>) -> Self {
        Self { routes }
    }
}

#[async_trait::async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, project: &str) -> Result<String, ResolveError> {
        match self.routes.get(project) {
            Some(address) => {
                debug!(project, "resolved from static table");
                Ok(address.clone())
            }
            None => Err(ResolveError::NotFound(project.to_string())),
        }
    }

    async fn check(&self) -> anyhow::Result<()> {
        ensure!(!self.routes.is_empty(), "static routing table is empty");
        Ok(())
    }
}

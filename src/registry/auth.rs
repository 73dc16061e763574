//! Agent authentication at connect time.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::AuthError;
use crate::transport::AgentConnectMetadata;

/// Principal type an agent connection must resolve to.
pub const AGENT_KIND: &str = "agent";

/// An authenticated agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub node_id: String,
}

/// Resolves handshake metadata to a principal, or rejects the connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, metadata: &AgentConnectMetadata) -> Result<Principal, AuthError>;
}

/// A known principal, as listed in the controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrincipalRecord {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub node_id: String,
}

fn default_kind() -> String {
    AGENT_KIND.to_string()
}

/// Authenticates against a fixed table of principals.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    principals: HashMap<String, PrincipalRecord>,
}

impl StaticAuthenticator {
    pub fn new(records: impl IntoIterator<Item = PrincipalRecord>) -> Self {
        Self {
            principals: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    /// Agent principals with the given IDs, each on a node named after it.
    pub fn agents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ids.into_iter().map(|id| {
            let id = id.into();
            PrincipalRecord {
                node_id: format!("{id}-node"),
                id,
                kind: AGENT_KIND.to_string(),
            }
        }))
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, metadata: &AgentConnectMetadata) -> Result<Principal, AuthError> {
        if metadata.id.is_empty() {
            return Err(AuthError::EmptyId);
        }
        let record = self
            .principals
            .get(&metadata.id)
            .ok_or_else(|| AuthError::Unknown(metadata.id.clone()))?;
        if record.kind != AGENT_KIND {
            return Err(AuthError::WrongType {
                id: metadata.id.clone(),
                found: record.kind.clone(),
            });
        }
        if metadata.version.trim().is_empty() {
            return Err(AuthError::MissingVersion(metadata.id.clone()));
        }
        Ok(Principal {
            id: record.id.clone(),
            node_id: record.node_id.clone(),
        })
    }
}

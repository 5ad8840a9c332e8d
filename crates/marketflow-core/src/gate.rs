use crate::error::WorkflowError;
use crate::policy::{self, Action, Resource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Provider,
    /// Holds the administrative capability (cancel, refund, export, reconcile).
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Provider => "provider",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn customer(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Customer)
    }

    pub fn provider(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Provider)
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Admin)
    }
}

/// Maps a presented credential to an identity. Lookup only, no mutation.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<Option<Identity>, WorkflowError>;
}

/// Static bearer-token directory.
#[derive(Debug, Clone, Default)]
pub struct TokenDirectory {
    tokens: HashMap<String, Identity>,
}

impl TokenDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    /// Parse `{"<token>": {"user_id": "...", "role": "customer|provider|admin"}}`.
    pub fn from_json(raw: &str) -> Result<Self, WorkflowError> {
        let tokens: HashMap<String, Identity> = serde_json::from_str(raw)
            .map_err(|e| WorkflowError::InvalidInput(format!("identity directory: {e}")))?;
        if let Some(empty) = tokens.keys().find(|token| token.trim().is_empty()) {
            return Err(WorkflowError::InvalidInput(format!(
                "identity directory contains blank token '{empty}'"
            )));
        }
        Ok(Self { tokens })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::InvalidInput(format!(
                "failed to read identity directory {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for TokenDirectory {
    async fn resolve(&self, credential: &str) -> Result<Option<Identity>, WorkflowError> {
        Ok(self.tokens.get(credential).cloned())
    }
}

/// Request-time identity resolution plus the centralized access policy.
#[derive(Clone)]
pub struct AuthorizationGate {
    resolver: Arc<dyn IdentityResolver>,
}

impl AuthorizationGate {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { resolver }
    }

    pub async fn resolve_caller(&self, credential: Option<&str>) -> Result<Identity, WorkflowError> {
        let credential = credential
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| WorkflowError::Unauthenticated("missing credential".to_string()))?;
        self.resolver
            .resolve(credential)
            .await?
            .ok_or_else(|| WorkflowError::Unauthenticated("unknown credential".to_string()))
    }

    pub fn require_role(&self, identity: &Identity, role: Role) -> Result<(), WorkflowError> {
        policy::require_role(identity, role)
    }

    pub fn authorize(
        &self,
        identity: &Identity,
        resource: &Resource<'_>,
        action: Action,
    ) -> Result<(), WorkflowError> {
        policy::authorize(identity, resource, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn gate() -> AuthorizationGate {
        let directory = TokenDirectory::new()
            .with_token("tok-cust", Identity::customer("cust-1"))
            .with_token("tok-prov", Identity::provider("prov-1"));
        AuthorizationGate::new(Arc::new(directory))
    }

    #[tokio::test]
    async fn resolves_known_tokens() {
        let identity = gate().resolve_caller(Some("tok-prov")).await.unwrap();
        assert_eq!(identity, Identity::provider("prov-1"));
    }

    #[tokio::test]
    async fn missing_or_unknown_credentials_are_unauthenticated() {
        let gate = gate();
        for credential in [None, Some(""), Some("   "), Some("tok-nope")] {
            let err = gate.resolve_caller(credential).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unauthenticated);
        }
    }

    #[test]
    fn directory_parses_role_labels() {
        let directory = TokenDirectory::from_json(
            r#"{"a": {"user_id": "ops", "role": "admin"}, "b": {"user_id": "c", "role": "customer"}}"#,
        )
        .unwrap();
        assert_eq!(directory.len(), 2);
        assert!(TokenDirectory::from_json(r#"{"x": {"user_id": "u", "role": "root"}}"#).is_err());
    }
}

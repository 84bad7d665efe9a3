//! Collaborator interfaces the engine calls out to.
//!
//! Persistence, credential decryption, and request logging live outside this
//! core. The engine only sees these traits; `MemoryStore` is a complete
//! in-process implementation used by tests and by embedders that have no
//! database yet.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use conduit_types::{
    ActionSpec, CompositeTool, Connection, Credential, Integration, Pipeline, RequestLogEntry,
};
use serde_json::Value;

/// A tenant- or connection-scoped stored variable.
#[derive(Debug, Clone)]
pub struct StoredVariable {
    /// Stored value.
    pub value: Value,
    /// Sensitive values never leave the resolver unmasked.
    pub sensitive: bool,
}

impl StoredVariable {
    /// Plain (non-sensitive) variable.
    pub fn plain(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            sensitive: false,
        }
    }

    /// Secret-flagged variable.
    pub fn secret(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            sensitive: true,
        }
    }
}

/// Read access to stored named variables.
#[async_trait]
pub trait VariableStore: Send + Sync {
    /// Looks up a connection-scoped variable by name.
    async fn connection_variable(&self, connection_id: &str, name: &str) -> Result<Option<StoredVariable>>;

    /// Looks up a tenant-scoped variable by name.
    async fn tenant_variable(&self, tenant_id: &str, name: &str) -> Result<Option<StoredVariable>>;
}

/// Read access to the tenant's registered entities.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn find_integration(&self, tenant_id: &str, slug: &str) -> Result<Option<Integration>>;

    async fn find_action(&self, tenant_id: &str, integration_slug: &str, action_slug: &str) -> Result<Option<ActionSpec>>;

    async fn find_connection(&self, tenant_id: &str, connection_id: &str) -> Result<Option<Connection>>;

    async fn find_composite_tool(&self, tenant_id: &str, slug: &str) -> Result<Option<CompositeTool>>;

    /// Finds a pipeline by slug or id.
    async fn find_pipeline(&self, tenant_id: &str, slug_or_id: &str) -> Result<Option<Pipeline>>;

    /// All integration slugs registered for the tenant.
    async fn integration_slugs(&self, tenant_id: &str) -> Result<Vec<String>>;
}

/// End-user credential scope (app-issued credentials).
#[derive(Debug, Clone)]
pub struct ExternalUserRef {
    pub app_id: String,
    pub external_user_id: String,
}

/// Resolves the credential to sign a call with.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Picks the credential for (integration, connection, end user).
    ///
    /// `None` means no active credential exists; the gateway turns that into
    /// a `MISSING_CREDENTIALS` failure.
    async fn resolve(
        &self,
        tenant_id: &str,
        integration: &Integration,
        connection_id: Option<&str>,
        external_user: Option<&ExternalUserRef>,
    ) -> Result<Option<Credential>>;
}

/// Fire-and-forget request log sink, one record per attempt set.
pub trait RequestLogSink: Send + Sync {
    fn record(&self, entry: RequestLogEntry);
}

/// Sink that drops every record.
#[derive(Debug, Default)]
pub struct NoopLogSink;

impl RequestLogSink for NoopLogSink {
    fn record(&self, _entry: RequestLogEntry) {}
}

/// Sink that keeps records in memory, for tests and local debugging.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<RequestLogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn entries(&self) -> Vec<RequestLogEntry> {
        self.entries.lock().expect("log sink lock").clone()
    }
}

impl RequestLogSink for MemoryLogSink {
    fn record(&self, entry: RequestLogEntry) {
        self.entries.lock().expect("log sink lock").push(entry);
    }
}

/// In-process implementation of every collaborator trait.
///
/// Populate with the `add_*` methods, then share behind an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    integrations: Vec<Integration>,
    actions: Vec<ActionSpec>,
    connections: Vec<Connection>,
    composite_tools: Vec<CompositeTool>,
    pipelines: Vec<Pipeline>,
    credentials: Vec<Credential>,
    tenant_variables: HashMap<(String, String), StoredVariable>,
    connection_variables: HashMap<(String, String), StoredVariable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_integration(&mut self, integration: Integration) -> &mut Self {
        self.integrations.push(integration);
        self
    }

    pub fn add_action(&mut self, action: ActionSpec) -> &mut Self {
        self.actions.push(action);
        self
    }

    pub fn add_connection(&mut self, connection: Connection) -> &mut Self {
        self.connections.push(connection);
        self
    }

    pub fn add_composite_tool(&mut self, tool: CompositeTool) -> &mut Self {
        self.composite_tools.push(tool);
        self
    }

    pub fn add_pipeline(&mut self, pipeline: Pipeline) -> &mut Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn add_credential(&mut self, credential: Credential) -> &mut Self {
        self.credentials.push(credential);
        self
    }

    pub fn add_tenant_variable(&mut self, tenant_id: &str, name: &str, variable: StoredVariable) -> &mut Self {
        self.tenant_variables.insert((tenant_id.to_string(), name.to_string()), variable);
        self
    }

    pub fn add_connection_variable(&mut self, connection_id: &str, name: &str, variable: StoredVariable) -> &mut Self {
        self.connection_variables
            .insert((connection_id.to_string(), name.to_string()), variable);
        self
    }
}

#[async_trait]
impl VariableStore for MemoryStore {
    async fn connection_variable(&self, connection_id: &str, name: &str) -> Result<Option<StoredVariable>> {
        Ok(self
            .connection_variables
            .get(&(connection_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn tenant_variable(&self, tenant_id: &str, name: &str) -> Result<Option<StoredVariable>> {
        Ok(self.tenant_variables.get(&(tenant_id.to_string(), name.to_string())).cloned())
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn find_integration(&self, tenant_id: &str, slug: &str) -> Result<Option<Integration>> {
        Ok(self
            .integrations
            .iter()
            .find(|integration| integration.tenant_id == tenant_id && integration.slug == slug)
            .cloned())
    }

    async fn find_action(&self, tenant_id: &str, integration_slug: &str, action_slug: &str) -> Result<Option<ActionSpec>> {
        let owned = self
            .integrations
            .iter()
            .any(|integration| integration.tenant_id == tenant_id && integration.slug == integration_slug);
        if !owned {
            return Ok(None);
        }
        Ok(self
            .actions
            .iter()
            .find(|action| action.integration_slug == integration_slug && action.slug == action_slug)
            .cloned())
    }

    async fn find_connection(&self, _tenant_id: &str, connection_id: &str) -> Result<Option<Connection>> {
        Ok(self.connections.iter().find(|connection| connection.id == connection_id).cloned())
    }

    async fn find_composite_tool(&self, tenant_id: &str, slug: &str) -> Result<Option<CompositeTool>> {
        Ok(self
            .composite_tools
            .iter()
            .find(|tool| tool.tenant_id == tenant_id && tool.slug == slug)
            .cloned())
    }

    async fn find_pipeline(&self, tenant_id: &str, slug_or_id: &str) -> Result<Option<Pipeline>> {
        Ok(self
            .pipelines
            .iter()
            .find(|pipeline| pipeline.tenant_id == tenant_id && (pipeline.slug == slug_or_id || pipeline.id == slug_or_id))
            .cloned())
    }

    async fn integration_slugs(&self, tenant_id: &str) -> Result<Vec<String>> {
        Ok(self
            .integrations
            .iter()
            .filter(|integration| integration.tenant_id == tenant_id)
            .map(|integration| integration.slug.clone())
            .collect())
    }
}

#[async_trait]
impl CredentialResolver for MemoryStore {
    async fn resolve(
        &self,
        _tenant_id: &str,
        integration: &Integration,
        connection_id: Option<&str>,
        external_user: Option<&ExternalUserRef>,
    ) -> Result<Option<Credential>> {
        let scoped = self
            .credentials
            .iter()
            .filter(|credential| credential.integration_id == integration.id && credential.active);

        let found = match (external_user, connection_id) {
            (Some(user), _) => scoped
                .into_iter()
                .find(|credential| credential.external_user_id.as_deref() == Some(user.external_user_id.as_str())),
            (None, Some(connection)) => scoped
                .into_iter()
                .find(|credential| credential.connection_id.as_deref() == Some(connection)),
            (None, None) => scoped
                .into_iter()
                .find(|credential| credential.connection_id.is_none() && credential.external_user_id.is_none()),
        };
        Ok(found.cloned())
    }
}

//! The capability registry.
//!
//! Capabilities live in a [`Catalog`] keyed by `(kind, name)`, where the name
//! of a resource is its URI or URI template. The [`Registry`] holds the
//! current catalog behind an `RwLock<Arc<Catalog>>`:
//!
//! - writers are serialised by the lock and replace the catalog
//!   copy-on-write, so a reader never sees a half-applied registration;
//! - sessions clone the `Arc` once when they are created and dispatch
//!   against that snapshot without taking any lock.
//!
//! # Consistency
//!
//! A registration is visible to every session created after it returns.
//! Sessions that were already open keep the snapshot they started with and
//! will not see it. This is intended: dispatch stays lock-free, and a
//! capability cannot change underneath a session that is using it.
//!
//! Whether registration is allowed at all once the server runs is decided by
//! [`LateRegistration`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{HandlerError, RegistryError};
use crate::mcp::capability::{
    Capability, CapabilityKind, CapabilityMetadata, PromptDefinition, RequestContext,
    ResourceDefinition, ToolDefinition,
};

/// What happens to registrations made after the server started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateRegistration {
    /// Accept them; only sessions created afterwards see them.
    #[default]
    Allow,
    /// Reject them with [`RegistryError::Frozen`].
    Reject,
}

/// Registry behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Fail duplicate registrations instead of overwriting them.
    pub strict: bool,
    /// Policy for registrations after the server started.
    pub late_registration: LateRegistration,
}

type CatalogKey = (CapabilityKind, String);

/// An immutable set of capabilities, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: IndexMap<CatalogKey, Arc<Capability>>,
}

impl Catalog {
    /// Finds a capability by kind and key.
    ///
    /// For resources, `key` is matched against the registered URI exactly;
    /// use [`Catalog::resolve_resource`] to match templates.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if nothing is registered under the key.
    pub fn lookup(&self, kind: CapabilityKind, key: &str) -> Result<Arc<Capability>, RegistryError> {
        self.entries
            .get(&(kind, key.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                kind,
                key: key.to_string(),
            })
    }

    /// Resolves a concrete resource URI.
    ///
    /// Exact registrations win; otherwise templates are tried in registration
    /// order and the first match wins. Returns the capability and the
    /// variables captured by its template (empty for exact matches).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no resource matches.
    pub fn resolve_resource(
        &self,
        uri: &str,
    ) -> Result<(Arc<Capability>, BTreeMap<String, String>), RegistryError> {
        if let Ok(exact) = self.lookup(CapabilityKind::Resource, uri) {
            if exact.template().is_none() {
                return Ok((exact, BTreeMap::new()));
            }
        }

        self.entries
            .iter()
            .filter(|((kind, _), _)| *kind == CapabilityKind::Resource)
            .find_map(|(_, cap)| {
                cap.template()
                    .and_then(|t| t.matches(uri))
                    .map(|vars| (Arc::clone(cap), vars))
            })
            .ok_or_else(|| RegistryError::NotFound {
                kind: CapabilityKind::Resource,
                key: uri.to_string(),
            })
    }

    /// A restartable view over the metadata of one kind.
    #[must_use]
    pub fn list(self: &Arc<Self>, kind: CapabilityKind) -> CapabilityList {
        CapabilityList {
            catalog: Arc::clone(self),
            kind,
        }
    }

    /// Number of registered capabilities of all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if at least one capability of `kind` is registered.
    #[must_use]
    pub fn has_kind(&self, kind: CapabilityKind) -> bool {
        self.entries.keys().any(|(k, _)| *k == kind)
    }
}

/// Metadata of every capability of one kind, taken from a single snapshot.
///
/// Iteration is lazy and can be restarted: each call to [`CapabilityList::iter`]
/// walks the same snapshot from the beginning.
#[derive(Debug, Clone)]
pub struct CapabilityList {
    catalog: Arc<Catalog>,
    kind: CapabilityKind,
}

impl CapabilityList {
    /// Iterates over the metadata in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &CapabilityMetadata> + '_ {
        self.catalog
            .entries
            .iter()
            .filter(move |((kind, _), _)| *kind == self.kind)
            .map(|(_, cap)| cap.metadata())
    }

    /// The kind this list covers.
    #[must_use]
    pub const fn kind(&self) -> CapabilityKind {
        self.kind
    }
}

impl<'a> IntoIterator for &'a CapabilityList {
    type Item = &'a CapabilityMetadata;
    type IntoIter = Box<dyn Iterator<Item = &'a CapabilityMetadata> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// The server's capability registry.
#[derive(Debug, Default)]
pub struct Registry {
    options: RegistryOptions,
    current: RwLock<Arc<Catalog>>,
    frozen: AtomicBool,
}

impl Registry {
    /// Creates an empty, permissive registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry with the given options.
    #[must_use]
    pub fn with_options(options: RegistryOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// The options this registry was created with.
    #[must_use]
    pub const fn options(&self) -> RegistryOptions {
        self.options
    }

    /// Registers a capability.
    ///
    /// In permissive mode an existing capability with the same kind and key
    /// is replaced and a warning is logged.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Duplicate`] in strict mode when the key is taken
    /// - [`RegistryError::Frozen`] after [`Registry::freeze`]
    pub fn register(&self, capability: Capability) -> Result<(), RegistryError> {
        let kind = capability.kind();
        let key = capability.key().to_string();

        if self.is_frozen() {
            return Err(RegistryError::Frozen { kind, key });
        }

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.entries.contains_key(&(kind, key.clone())) {
            if self.options.strict {
                return Err(RegistryError::Duplicate { kind, key });
            }
            tracing::warn!(%kind, key = %key, "Capability re-registered, replacing previous handler");
        } else {
            tracing::debug!(%kind, key = %key, "Capability registered");
        }

        Arc::make_mut(&mut current)
            .entries
            .insert((kind, key), Arc::new(capability));
        Ok(())
    }

    /// Registers a tool.
    ///
    /// # Errors
    ///
    /// See [`Registry::register`].
    pub fn register_tool<F, Fut>(&self, definition: ToolDefinition, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(Capability::tool(definition, handler))
    }

    /// Registers a resource or resource template.
    ///
    /// # Errors
    ///
    /// See [`Registry::register`]; also fails on malformed URI templates.
    pub fn register_resource<F, Fut>(
        &self,
        definition: ResourceDefinition,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(Capability::resource(definition, handler)?)
    }

    /// Registers a prompt.
    ///
    /// # Errors
    ///
    /// See [`Registry::register`].
    pub fn register_prompt<F, Fut>(&self, definition: PromptDefinition, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(Capability::prompt(definition, handler))
    }

    /// Removes a capability, returning it if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Frozen`] after [`Registry::freeze`].
    pub fn unregister(&self, kind: CapabilityKind, key: &str) -> Result<Option<Arc<Capability>>, RegistryError> {
        if self.is_frozen() {
            return Err(RegistryError::Frozen {
                kind,
                key: key.to_string(),
            });
        }
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if !current.entries.contains_key(&(kind, key.to_string())) {
            return Ok(None);
        }
        Ok(Arc::make_mut(&mut current)
            .entries
            .shift_remove(&(kind, key.to_string())))
    }

    /// Looks a capability up in the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if nothing is registered under the key.
    pub fn lookup(&self, kind: CapabilityKind, key: &str) -> Result<Arc<Capability>, RegistryError> {
        self.snapshot().lookup(kind, key)
    }

    /// Lists metadata of one kind from the current snapshot.
    #[must_use]
    pub fn list(&self, kind: CapabilityKind) -> CapabilityList {
        self.snapshot().list(kind)
    }

    /// The current catalog. Later registrations do not affect it.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Rejects every further registration.
    pub fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::AcqRel) {
            tracing::debug!("Capability registry frozen");
        }
    }

    /// Applies [`LateRegistration`] when the server starts serving.
    pub(crate) fn server_started(&self) {
        if self.options.late_registration == LateRegistration::Reject {
            self.freeze();
        }
    }

    /// Returns true once [`Registry::freeze`] has been called.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_tool(name: &str) -> Capability {
        Capability::tool(ToolDefinition::new(name, "echo"), |args, _ctx| async move { Ok(args) })
    }

    #[test]
    fn lookup_returns_registered_capability() {
        let registry = Registry::new();
        registry.register(echo_tool("echo")).unwrap();

        let cap = registry.lookup(CapabilityKind::Tool, "echo").unwrap();
        assert_eq!(cap.key(), "echo");
        assert!(registry.lookup(CapabilityKind::Prompt, "echo").is_err());
    }

    #[test]
    fn lookup_missing_is_not_found() {
        let registry = Registry::new();
        let err = registry.lookup(CapabilityKind::Tool, "subtract").unwrap_err();
        assert_eq!(
            err,
            RegistryError::NotFound {
                kind: CapabilityKind::Tool,
                key: "subtract".to_string()
            }
        );
    }

    #[test]
    fn permissive_mode_overwrites() {
        let registry = Registry::new();
        registry.register(echo_tool("echo")).unwrap();
        registry
            .register(Capability::tool(
                ToolDefinition::new("echo", "second"),
                |_args, _ctx| async { Ok(json!("second")) },
            ))
            .unwrap();

        let list = registry.list(CapabilityKind::Tool);
        let tools: Vec<_> = list.iter().collect();
        assert_eq!(tools.len(), 1);
        let CapabilityMetadata::Tool(def) = tools[0] else {
            panic!("Expected tool metadata");
        };
        assert_eq!(def.description.as_deref(), Some("second"));
    }

    #[test]
    fn strict_mode_rejects_duplicates() {
        let registry = Registry::with_options(RegistryOptions {
            strict: true,
            ..RegistryOptions::default()
        });
        registry.register(echo_tool("echo")).unwrap();
        let err = registry.register(echo_tool("echo")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
    }

    #[test]
    fn same_name_different_kind_is_not_a_duplicate() {
        let registry = Registry::with_options(RegistryOptions {
            strict: true,
            ..RegistryOptions::default()
        });
        registry.register(echo_tool("review")).unwrap();
        registry
            .register_prompt(PromptDefinition::new("review", "Review"), |_a, _c| async {
                Ok(json!("go"))
            })
            .unwrap();
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn list_preserves_registration_order_and_restarts() {
        let registry = Registry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(echo_tool(name)).unwrap();
        }

        let list = registry.list(CapabilityKind::Tool);
        let first: Vec<&str> = list.iter().map(CapabilityMetadata::key).collect();
        let second: Vec<&str> = list.iter().map(CapabilityMetadata::key).collect();
        assert_eq!(first, vec!["zeta", "alpha", "mid"]);
        assert_eq!(first, second);
    }

    #[test]
    fn snapshot_is_isolated_from_later_registrations() {
        let registry = Registry::new();
        registry.register(echo_tool("before")).unwrap();
        let snapshot = registry.snapshot();

        registry.register(echo_tool("after")).unwrap();

        assert!(snapshot.lookup(CapabilityKind::Tool, "after").is_err());
        assert!(registry.lookup(CapabilityKind::Tool, "after").is_ok());
    }

    #[test]
    fn freeze_rejects_late_registration() {
        let registry = Registry::with_options(RegistryOptions {
            late_registration: LateRegistration::Reject,
            ..RegistryOptions::default()
        });
        registry.register(echo_tool("early")).unwrap();
        registry.server_started();

        assert!(registry.is_frozen());
        let err = registry.register(echo_tool("late")).unwrap_err();
        assert!(matches!(err, RegistryError::Frozen { .. }));
        assert!(registry.unregister(CapabilityKind::Tool, "early").is_err());
    }

    #[test]
    fn allow_policy_keeps_registry_open() {
        let registry = Registry::new();
        registry.server_started();
        assert!(!registry.is_frozen());
        registry.register(echo_tool("late")).unwrap();
    }

    #[test]
    fn unregister_removes() {
        let registry = Registry::new();
        registry.register(echo_tool("gone")).unwrap();
        let removed = registry.unregister(CapabilityKind::Tool, "gone").unwrap();
        assert!(removed.is_some());
        assert!(registry.lookup(CapabilityKind::Tool, "gone").is_err());
        assert!(registry
            .unregister(CapabilityKind::Tool, "gone")
            .unwrap()
            .is_none());
    }

    #[test]
    fn resolve_resource_prefers_exact_match() {
        let registry = Registry::new();
        registry
            .register_resource(ResourceDefinition::new("notes://{id}", "note"), |_a, _c| async {
                Ok(json!("template"))
            })
            .unwrap();
        registry
            .register_resource(ResourceDefinition::new("notes://index", "index"), |_a, _c| async {
                Ok(json!("exact"))
            })
            .unwrap();

        let catalog = registry.snapshot();
        let (cap, vars) = catalog.resolve_resource("notes://index").unwrap();
        assert_eq!(cap.key(), "notes://index");
        assert!(vars.is_empty());

        let (cap, vars) = catalog.resolve_resource("notes://42").unwrap();
        assert_eq!(cap.key(), "notes://{id}");
        assert_eq!(vars["id"], "42");

        assert!(catalog.resolve_resource("other://42").is_err());
    }
}

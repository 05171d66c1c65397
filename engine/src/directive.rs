//! Model sync directives: the static, per-type sync policy.
//!
//! A directive is defined once at startup and never mutated. Everything the
//! engine needs to know about a record type (direction, schema, nested
//! relations, channel routes, scope filter) hangs off it.

use crate::channel::ChannelRoute;
use crate::{error::Result, Error, ModelSchema, RecordType};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Which way rows of a type travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    /// Never produces or consumes staging records.
    #[serde(rename = "none")]
    DoNotSync,
    /// Facility to central only.
    PushOnly,
    /// Central to facility only.
    PullOnly,
    Bidirectional,
}

impl SyncDirection {
    pub fn is_synced(&self) -> bool {
        !matches!(self, SyncDirection::DoNotSync)
    }

    pub fn can_push(&self) -> bool {
        matches!(self, SyncDirection::PushOnly | SyncDirection::Bidirectional)
    }

    pub fn can_pull(&self) -> bool {
        matches!(self, SyncDirection::PullOnly | SyncDirection::Bidirectional)
    }

    /// Whether this node captures rows of the type for sending.
    pub fn sends_from(&self, role: NodeRole) -> bool {
        match role {
            NodeRole::Central => self.can_pull(),
            NodeRole::Facility => self.can_push(),
        }
    }

    /// Whether this node accepts rows of the type from its peer.
    pub fn receives_at(&self, role: NodeRole) -> bool {
        match role {
            NodeRole::Central => self.can_push(),
            NodeRole::Facility => self.can_pull(),
        }
    }
}

/// The part a node plays in the sync topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Central,
    Facility,
}

/// Per-session options handed to scope filter builders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Send every open lab request, not only those of scoped patients.
    pub sync_all_lab_requests: bool,
    pub is_mobile: bool,
}

/// A row filter restricting a snapshot to the scope of one peer.
///
/// Kept structural rather than textual so each storage backend can evaluate
/// it natively and so ids never get spliced into query text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ScopeFilter {
    /// `field` is one of `values`.
    FieldIn { field: String, values: Vec<String> },
    /// `field` references a row of `via_type` whose `via_field` is one of
    /// `values`.
    Related {
        field: String,
        via_type: RecordType,
        via_field: String,
        values: Vec<String>,
    },
    /// Any of the inner filters matches.
    Any { filters: Vec<ScopeFilter> },
    /// Every inner filter matches.
    All { filters: Vec<ScopeFilter> },
}

impl ScopeFilter {
    pub fn field_in(field: impl Into<String>, values: &[String]) -> Self {
        ScopeFilter::FieldIn {
            field: field.into(),
            values: values.to_vec(),
        }
    }

    pub fn related(
        field: impl Into<String>,
        via_type: impl Into<RecordType>,
        via_field: impl Into<String>,
        values: &[String],
    ) -> Self {
        ScopeFilter::Related {
            field: field.into(),
            via_type: via_type.into(),
            via_field: via_field.into(),
            values: values.to_vec(),
        }
    }
}

/// Builds the scope filter for a set of scope ids.
///
/// Returning `None` means the type syncs everywhere under this session config.
pub type SyncFilterBuilder =
    Arc<dyn Fn(&[String], &SessionConfig) -> Option<ScopeFilter> + Send + Sync>;

/// Computes the channels a scope subscribes to for one type. May need its own
/// database or settings lookup, hence async.
pub trait ChannelSource: Send + Sync {
    fn channels<'a>(&'a self, scope_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;
}

/// Static sync policy for one record type.
#[derive(Clone)]
pub struct ModelSyncDirective {
    /// Record type name; also the default channel.
    pub name: RecordType,
    /// Backing table.
    pub table: String,
    pub direction: SyncDirection,
    pub schema: ModelSchema,
    /// Relation paths (`lab_requests.tests`) embedded when this type syncs.
    pub included_sync_relations: Vec<String>,
    pub channel_routes: Vec<ChannelRoute>,
    sync_filter: Option<SyncFilterBuilder>,
    channel_source: Option<Arc<dyn ChannelSource>>,
}

impl fmt::Debug for ModelSyncDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSyncDirective")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("direction", &self.direction)
            .field("included_sync_relations", &self.included_sync_relations)
            .field("channel_routes", &self.channel_routes)
            .field("has_sync_filter", &self.sync_filter.is_some())
            .field("has_channel_source", &self.channel_source.is_some())
            .finish()
    }
}

impl ModelSyncDirective {
    pub fn new(
        name: impl Into<RecordType>,
        table: impl Into<String>,
        direction: SyncDirection,
        schema: ModelSchema,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            direction,
            schema,
            included_sync_relations: Vec::new(),
            channel_routes: Vec::new(),
            sync_filter: None,
            channel_source: None,
        }
    }

    /// Builder-style method to embed a relation path.
    pub fn with_included_relation(mut self, path: impl Into<String>) -> Self {
        self.included_sync_relations.push(path.into());
        self
    }

    /// Builder-style method to register a channel route pattern.
    pub fn with_route(mut self, pattern: &str) -> Result<Self> {
        self.channel_routes.push(ChannelRoute::parse(pattern)?);
        Ok(self)
    }

    pub fn with_sync_filter<F>(mut self, builder: F) -> Self
    where
        F: Fn(&[String], &SessionConfig) -> Option<ScopeFilter> + Send + Sync + 'static,
    {
        self.sync_filter = Some(Arc::new(builder));
        self
    }

    pub fn with_channel_source(mut self, source: Arc<dyn ChannelSource>) -> Self {
        self.channel_source = Some(source);
        self
    }

    pub fn default_channel(&self) -> &str {
        &self.name
    }

    pub fn has_sync_filter(&self) -> bool {
        self.sync_filter.is_some()
    }

    /// Build the filter for `scope_ids`, or `None` when the type is unscoped
    /// (no builder, or the builder opted out for this session config).
    pub fn build_sync_filter(
        &self,
        scope_ids: &[String],
        config: &SessionConfig,
    ) -> Option<ScopeFilter> {
        self.sync_filter
            .as_ref()
            .and_then(|build| build(scope_ids, config))
    }

    /// Channels a scope subscribes to for this type.
    pub async fn channels(&self, scope_id: &str) -> Result<Vec<String>> {
        if let Some(source) = &self.channel_source {
            return source.channels(scope_id).await;
        }
        if self.channel_routes.is_empty() {
            return Ok(vec![self.name.clone()]);
        }
        Ok(self
            .channel_routes
            .iter()
            .filter_map(|route| route.fill_single(scope_id))
            .collect())
    }
}

/// All directives known to a node, indexed by record type.
#[derive(Debug, Clone, Default)]
pub struct DirectiveRegistry {
    directives: Vec<Arc<ModelSyncDirective>>,
    by_name: HashMap<RecordType, usize>,
}

impl DirectiveRegistry {
    /// Build a registry, checking names are unique and every included relation
    /// path resolves.
    pub fn new(directives: Vec<ModelSyncDirective>) -> Result<Self> {
        let mut registry = Self::default();
        for directive in directives {
            if registry.by_name.contains_key(&directive.name) {
                return Err(Error::DuplicateDirective(directive.name));
            }
            registry
                .by_name
                .insert(directive.name.clone(), registry.directives.len());
            registry.directives.push(Arc::new(directive));
        }

        for directive in &registry.directives {
            for path in &directive.included_sync_relations {
                registry.resolve_relation(&directive.name, path)?;
            }
        }

        Ok(registry)
    }

    /// Look up a directive; unknown names are a protocol error.
    pub fn get(&self, name: &str) -> Result<&Arc<ModelSyncDirective>> {
        self.by_name
            .get(name)
            .map(|&i| &self.directives[i])
            .ok_or_else(|| Error::UnknownRecordType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelSyncDirective>> {
        self.directives.iter()
    }

    /// Directives that take part in sync at all.
    pub fn syncable(&self) -> impl Iterator<Item = &Arc<ModelSyncDirective>> {
        self.directives.iter().filter(|d| d.direction.is_synced())
    }

    /// Names of the types this node sends.
    pub fn outgoing_types(&self, role: NodeRole) -> Vec<RecordType> {
        self.directives
            .iter()
            .filter(|d| d.direction.sends_from(role))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Names of the types this node accepts.
    pub fn incoming_types(&self, role: NodeRole) -> Vec<RecordType> {
        self.directives
            .iter()
            .filter(|d| d.direction.receives_at(role))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Follow a dotted relation path from `root`, returning every type visited
    /// after the root.
    pub fn resolve_relation(&self, root: &str, path: &str) -> Result<Vec<RecordType>> {
        let mut current = self.get(root)?;
        let mut visited = Vec::new();
        for alias in path.split('.') {
            let association =
                current
                    .schema
                    .association(alias)
                    .ok_or_else(|| Error::UnknownRelation {
                        record_type: current.name.clone(),
                        relation: alias.to_string(),
                    })?;
            current = self.get(&association.target)?;
            visited.push(current.name.clone());
        }
        Ok(visited)
    }
}

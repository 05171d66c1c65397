//! Channel routing.
//!
//! A channel is an opaque `/`-delimited string naming one scoped subscription,
//! e.g. `patient/abc123/issue`. Directives register parametrized patterns
//! (`patient/:patientId/issue`); every pattern from every directive goes into
//! one router, and resolving a concrete string yields exactly one record type
//! plus the extracted parameters.
//!
//! Every synced directive is also reachable through its default channel,
//! which is its own name.

use crate::{error::Result, DirectiveRegistry, Error, RecordType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed route pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRoute {
    pub pattern: String,
    pub param_names: Vec<String>,
    segments: Vec<Segment>,
}

impl ChannelRoute {
    /// Parse a pattern. Segments must be non-empty; `:name` marks a parameter
    /// and names must be unique within the pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = || Error::InvalidRoute(pattern.to_string());
        if pattern.is_empty() || pattern.contains('?') || pattern.contains('*') {
            return Err(invalid());
        }

        let mut segments = Vec::new();
        let mut param_names: Vec<String> = Vec::new();
        for raw in pattern.split('/') {
            if raw.is_empty() {
                return Err(invalid());
            }
            match raw.strip_prefix(':') {
                Some("") => return Err(invalid()),
                Some(name) => {
                    if param_names.iter().any(|n| n == name) {
                        return Err(invalid());
                    }
                    param_names.push(name.to_string());
                    segments.push(Segment::Param(name.to_string()));
                }
                None => segments.push(Segment::Literal(raw.to_string())),
            }
        }

        Ok(Self {
            pattern: pattern.to_string(),
            param_names,
            segments,
        })
    }

    /// Match a concrete channel, returning the extracted parameters.
    fn matches(&self, parts: &[&str]) -> Option<BTreeMap<String, String>> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = BTreeMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }

    /// Literal-versus-parameter layout; two routes with the same shape can
    /// never be told apart.
    fn shape(&self) -> Vec<Option<&str>> {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => Some(lit.as_str()),
                Segment::Param(_) => None,
            })
            .collect()
    }

    /// Literal segments rank above parameters, position by position.
    fn specificity(&self) -> Vec<bool> {
        self.segments
            .iter()
            .map(|s| matches!(s, Segment::Literal(_)))
            .collect()
    }

    /// Substitute `value` for the pattern's only parameter.
    pub fn fill_single(&self, value: &str) -> Option<String> {
        if self.param_names.len() != 1 || value.is_empty() || value.contains('/') {
            return None;
        }
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => lit.as_str(),
                Segment::Param(_) => value,
            })
            .collect();
        Some(parts.join("/"))
    }
}

/// Result of resolving a channel string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedChannel {
    pub record_type: RecordType,
    pub params: BTreeMap<String, String>,
}

/// Path router over every directive's channel routes.
#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    routes: Vec<(ChannelRoute, RecordType)>,
}

impl ChannelRouter {
    /// Register all routes of all synced directives.
    ///
    /// Fails when two routes share a shape, or when a directive's default
    /// channel resolves to some other type.
    pub fn build(registry: &DirectiveRegistry) -> Result<Self> {
        let mut router = Self::default();
        let mut shapes: HashMap<Vec<Option<String>>, RecordType> = HashMap::new();

        for directive in registry.syncable() {
            let default_route = ChannelRoute::parse(directive.default_channel())?;
            let routes = directive
                .channel_routes
                .iter()
                .cloned()
                .chain(std::iter::once(default_route));

            for route in routes {
                let shape: Vec<Option<String>> = route
                    .shape()
                    .into_iter()
                    .map(|s| s.map(str::to_string))
                    .collect();
                if let Some(first) = shapes.get(&shape) {
                    return Err(Error::DuplicateRoute {
                        pattern: route.pattern.clone(),
                        first: first.clone(),
                        second: directive.name.clone(),
                    });
                }
                shapes.insert(shape, directive.name.clone());
                router.routes.push((route, directive.name.clone()));
            }
        }

        for directive in registry.syncable() {
            match router.resolve(directive.default_channel()) {
                Ok(resolved) if resolved.record_type == directive.name => {}
                _ => return Err(Error::UnreachableChannel(directive.name.clone())),
            }
        }

        debug!(routes = router.routes.len(), "channel router built");
        Ok(router)
    }

    /// Resolve a concrete channel string. Unmatched channels are a protocol
    /// error.
    pub fn resolve(&self, channel: &str) -> Result<ResolvedChannel> {
        let parts: Vec<&str> = channel.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(Error::UnmatchedChannel(channel.to_string()));
        }

        self.routes
            .iter()
            .filter_map(|(route, record_type)| {
                route
                    .matches(&parts)
                    .map(|params| (route.specificity(), record_type, params))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, record_type, params)| ResolvedChannel {
                record_type: record_type.clone(),
                params,
            })
            .ok_or_else(|| Error::UnmatchedChannel(channel.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Compute the full channel set a scope subscribes to, across every synced
/// directive. Order follows registration; duplicates are dropped.
pub async fn channels_for_scope(registry: &DirectiveRegistry, scope_id: &str) -> Result<Vec<String>> {
    let mut channels: Vec<String> = Vec::new();
    for directive in registry.syncable() {
        for channel in directive.channels(scope_id).await? {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
    }
    Ok(channels)
}

//! # FieldSync Engine
//!
//! The core of a facility/central sync engine for partially-offline sites.
//!
//! This crate decides what changed, in what order it is safe to transmit and
//! apply it, how to scope it to the patients a facility cares about, and how
//! to flag incoming rows that collide with local edits. It performs no I/O;
//! storage, transport and scheduling of sessions live in the server crate.
//!
//! ## Core Concepts
//!
//! ### Directives
//!
//! Every record type has one [`ModelSyncDirective`]: its [`SyncDirection`],
//! schema, embedded relations, channel routes and an optional scope filter
//! builder. Directives are collected in a [`DirectiveRegistry`] at startup.
//!
//! ### Dependency order
//!
//! [`DependencyGraph`] orders types so every belongs-to parent precedes its
//! children. [`DependencyGraph::sorted`] gives a topological order;
//! [`DependencyGraph::run`] executes an async task per type, running
//! independent branches concurrently.
//!
//! ### Sync clock
//!
//! A single counter stamps every write. Sessions take a [`TickTock`] so writes
//! made while a session runs are never missed by the next one.
//!
//! ### Channels
//!
//! A channel is an opaque `/`-delimited string such as `patient/p1/issue`.
//! The [`ChannelRouter`] resolves it back to a record type and parameters;
//! [`ChannelCache`] memoises per-scope channel sets.
//!
//! ### Merging
//!
//! [`plan_merge`] orders incoming staging records, runs conflict detection and
//! applies a [`ConflictResolver`]. Conflicts are reported, never thrown.
//!
//! ## Quick Start
//!
//! ```rust
//! use fieldsync_engine::{
//!     Association, ChannelRouter, DependencyGraph, DirectiveRegistry, FieldDef, FieldType,
//!     ModelSchema, ModelSyncDirective, SyncDirection,
//! };
//!
//! let patient = ModelSyncDirective::new(
//!     "Patient",
//!     "patients",
//!     SyncDirection::Bidirectional,
//!     ModelSchema::new(vec![FieldDef::new("id", FieldType::String)]),
//! );
//! let issue = ModelSyncDirective::new(
//!     "PatientIssue",
//!     "patient_issues",
//!     SyncDirection::Bidirectional,
//!     ModelSchema::new(vec![FieldDef::new("patient_id", FieldType::String)])
//!         .with_association(Association::belongs_to("patient", "Patient", "patient_id")),
//! )
//! .with_route("patient/:patientId/issue")
//! .unwrap();
//!
//! let registry = DirectiveRegistry::new(vec![issue, patient]).unwrap();
//! let types: Vec<String> = registry.iter().map(|d| d.name.clone()).collect();
//!
//! let graph = DependencyGraph::build(&registry, &types).unwrap();
//! assert_eq!(graph.sorted().unwrap(), vec!["Patient", "PatientIssue"]);
//!
//! let router = ChannelRouter::build(&registry).unwrap();
//! let resolved = router.resolve("patient/abc-1/issue").unwrap();
//! assert_eq!(resolved.record_type, "PatientIssue");
//! assert_eq!(resolved.params["patientId"], "abc-1");
//! ```

pub mod cache;
pub mod channel;
pub mod clock;
pub mod conflict;
pub mod directive;
pub mod error;
pub mod graph;
pub mod record;
pub mod sanitize;
pub mod schedule;
pub mod schema;
pub mod session;

// Re-export main types at crate root
pub use cache::ChannelCache;
pub use channel::{channels_for_scope, ChannelRoute, ChannelRouter, ResolvedChannel};
pub use clock::{is_changed_since, SyncClock, TickTock};
pub use conflict::{
    detect, plan_merge, Capture, Conflict, ConflictKind, ConflictPolicy, ConflictResolver,
    LocalEvidence, MergeDecision, MergePlan, MergeReport, Resolution, ResolvedConflict,
};
pub use directive::{
    ChannelSource, DirectiveRegistry, ModelSyncDirective, NodeRole, ScopeFilter, SessionConfig,
    SyncDirection, SyncFilterBuilder,
};
pub use error::{Error, ErrorKind};
pub use graph::DependencyGraph;
pub use record::{
    updated_at_by_field_sum, Direction, IncomingChange, NewSessionRecord, StagingKey,
    SyncSessionRecord,
};
pub use sanitize::{sanitize, COLUMNS_EXCLUDED_FROM_SYNC};
pub use schema::{Association, AssociationKind, FieldDef, FieldType, ModelSchema};
pub use session::{SessionStatus, SyncSession};

/// Type aliases for clarity
pub type RecordType = String;
pub type RecordId = String;
/// Value of the sync clock.
pub type Tick = i64;
pub type SessionId = uuid::Uuid;

//! Sync session manager.
//!
//! [`SyncManager`] drives every session on this node: it creates sessions,
//! snapshots outgoing changes in the background, serves them in dependency
//! order, stages and merges incoming changes, and keeps the cursors. The
//! reaper started by [`SyncManager::spawn_reaper`] closes sessions whose peer
//! went away.

use crate::catalog::SYNC_ALL_LAB_REQUESTS;
use crate::config::SyncSettings;
use crate::cursor::CursorManager;
use crate::error::{AppError, Result};
use crate::merge::merge_incoming;
use crate::snapshot::Snapshotter;
use crate::store::SharedStore;
use chrono::Utc;
use dashmap::DashSet;
use fieldsync_engine::{
    ChannelCache, ChannelRouter, DependencyGraph, Direction, DirectiveRegistry, Error,
    IncomingChange, MergeReport, NewSessionRecord, RecordType, ResolvedChannel, SessionConfig,
    SessionId, SessionStatus, StagingKey, SyncSession, SyncSessionRecord, Tick,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// What the peer wants in an outgoing snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullFilter {
    /// Watermark override. Absent means "since the outgoing cursor".
    pub since: Option<Tick>,
    /// Restrict patient-scoped types to the patients linked to this facility.
    pub facility_id: Option<String>,
    /// Only snapshot the types these channels resolve to.
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub is_mobile: bool,
}

/// One page of outgoing records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPage {
    pub records: Vec<SyncSessionRecord>,
    /// Position of the last record, to continue from.
    pub next: Option<StagingKey>,
    pub has_more: bool,
}

/// One snapshot run over a type: rows changed since `since`, within `scope`.
#[derive(Debug, Clone)]
struct Pass {
    since: Tick,
    scope: Option<Vec<String>>,
}

#[derive(Debug)]
struct PullPlan {
    since: Tick,
    types: Vec<RecordType>,
    passes: HashMap<RecordType, Vec<Pass>>,
    config: SessionConfig,
}

/// Exclusive hold on a session while a snapshot runs or the session closes.
/// Released on drop.
struct SessionClaim {
    claims: Arc<DashSet<SessionId>>,
    id: SessionId,
}

impl SessionClaim {
    fn acquire(claims: &Arc<DashSet<SessionId>>, id: SessionId) -> Option<Self> {
        claims.insert(id).then(|| Self {
            claims: Arc::clone(claims),
            id,
        })
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

pub struct SyncManager {
    store: SharedStore,
    registry: Arc<DirectiveRegistry>,
    router: ChannelRouter,
    cache: ChannelCache,
    cursors: CursorManager,
    settings: SyncSettings,
    /// Transmission order of the types this node sends.
    outgoing_order: Vec<RecordType>,
    /// Application order of the types this node accepts.
    incoming_ranks: HashMap<RecordType, i32>,
    claims: Arc<DashSet<SessionId>>,
}

impl SyncManager {
    /// Build the manager. Cycles, duplicate routes and bad relation paths in
    /// the registry are reported here, before any session starts.
    pub fn new(
        store: SharedStore,
        registry: DirectiveRegistry,
        settings: SyncSettings,
    ) -> Result<Arc<Self>> {
        let router = ChannelRouter::build(&registry)?;
        let role = settings.node_role;
        let outgoing_order =
            DependencyGraph::build_strict(&registry, &registry.outgoing_types(role))?.sorted()?;
        let incoming_ranks =
            DependencyGraph::build(&registry, &registry.incoming_types(role))?.ranks()?;

        tracing::info!(
            role = ?role,
            outgoing = outgoing_order.len(),
            incoming = incoming_ranks.len(),
            routes = router.len(),
            "Sync manager ready"
        );

        Ok(Arc::new(Self {
            cursors: CursorManager::new(Arc::clone(&store)),
            store,
            registry: Arc::new(registry),
            router,
            cache: ChannelCache::new(),
            settings,
            outgoing_order,
            incoming_ranks,
            claims: Arc::new(DashSet::new()),
        }))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn outgoing_order(&self) -> &[RecordType] {
        &self.outgoing_order
    }

    pub async fn start_session(&self, debug_info: serde_json::Value) -> Result<SyncSession> {
        let tick_tock = self.store.tick_tock().await?;
        let session = SyncSession::new(Uuid::new_v4(), tick_tock.tick, Utc::now(), debug_info);
        self.store.insert_session(&session).await?;
        tracing::info!(session_id = %session.id, sync_tick = session.sync_tick, "Sync session started");
        Ok(session)
    }

    /// Load a session that can still make progress.
    async fn load_active(&self, id: SessionId) -> Result<SyncSession> {
        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or(AppError::SessionNotFound(id))?;
        if let Some(error) = &session.error {
            return Err(AppError::SessionErrored(error.clone()));
        }
        if session.is_closed() {
            return Err(AppError::SessionCompleted(id));
        }
        Ok(session)
    }

    /// Heartbeat.
    pub async fn connect(&self, id: SessionId) -> Result<SyncSession> {
        let mut session = self.load_active(id).await?;
        let now = Utc::now();
        self.store.touch_session(id, now).await?;
        session.touch(now);
        Ok(session)
    }

    pub async fn mark_errored(&self, id: SessionId, message: impl Into<String>) -> Result<()> {
        let mut session = self
            .store
            .get_session(id)
            .await?
            .ok_or(AppError::SessionNotFound(id))?;
        let message = message.into();
        tracing::warn!(session_id = %id, error = %message, "Sync session errored");
        session.error = Some(message);
        self.store.update_session(&session).await
    }

    /// Record `error` on the session, logging instead of failing if that
    /// write does not go through.
    async fn poison(&self, id: SessionId, error: &AppError) {
        if let Err(e) = self.mark_errored(id, error.to_string()).await {
            tracing::error!(session_id = %id, error = %e, "Failed to mark session errored");
        }
    }

    /// Close a session and drop its staging rows. Ending a closed session is
    /// a no-op; errored sessions can still be ended. A session whose snapshot
    /// is still running cannot be ended until it finishes.
    pub async fn end_session(&self, id: SessionId) -> Result<SyncSession> {
        let Some(_claim) = SessionClaim::acquire(&self.claims, id) else {
            return Err(AppError::SnapshotInProgress(id));
        };
        let mut session = self
            .store
            .get_session(id)
            .await?
            .ok_or(AppError::SessionNotFound(id))?;
        if session.is_closed() {
            return Ok(session);
        }
        let removed = self.store.delete_staging(id, None).await?;
        session.close(Utc::now())?;
        self.store.update_session(&session).await?;
        tracing::info!(session_id = %id, staging_removed = removed, "Sync session ended");
        Ok(session)
    }

    /// Validate the request and start the snapshot in the background. Poll
    /// [`fetch_pull_count`](Self::fetch_pull_count) for completion.
    pub async fn initiate_pull(self: &Arc<Self>, id: SessionId, filter: PullFilter) -> Result<()> {
        let Some(claim) = SessionClaim::acquire(&self.claims, id) else {
            return Err(AppError::SnapshotInProgress(id));
        };
        let mut session = self.load_active(id).await?;

        let plan = match self.plan_pull(&mut session, &filter).await {
            Ok(plan) => plan,
            Err(e) => {
                self.fail_pull(id, &e).await;
                return Err(e);
            }
        };

        tracing::info!(
            session_id = %id,
            since = plan.since,
            types = plan.types.len(),
            facility_id = ?filter.facility_id,
            "Snapshot started"
        );
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = match manager.run_snapshot(id, &plan).await {
                Ok(()) => manager.finish_snapshot(id).await,
                failed => failed,
            };
            if let Err(e) = result {
                manager.fail_pull(id, &e).await;
            }
            // completion is visible before the session can be pulled or ended again
            drop(claim);
        });
        Ok(())
    }

    async fn plan_pull(&self, session: &mut SyncSession, filter: &PullFilter) -> Result<PullPlan> {
        let channel_scopes = match &filter.channels {
            Some(channels) => Some(self.resolve_channels(channels)?),
            None => None,
        };

        let since = match filter.since {
            Some(since) => since,
            None => self.cursors.read(Direction::Outgoing).await?,
        };
        session.transition(SessionStatus::Outgoing)?;
        session.outgoing_since = Some(since);
        session.advance_outgoing_cursor = filter.since.is_none();
        session.snapshot_completed_at = None;
        session.touch(Utc::now());
        self.store.update_session(session).await?;

        // a channel pull is scoped by its channels alone
        let sync_all_lab_requests = channel_scopes.is_none()
            && !filter.is_mobile
            && self
                .store
                .setting(filter.facility_id.as_deref(), SYNC_ALL_LAB_REQUESTS)
                .await?
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
        let config = SessionConfig {
            sync_all_lab_requests,
            is_mobile: filter.is_mobile,
        };

        // patients linked since the watermark get their full history
        let facility_scope = match &filter.facility_id {
            Some(facility_id) => {
                let (fresh, known): (Vec<_>, Vec<_>) = self
                    .store
                    .facility_patients(facility_id)
                    .await?
                    .into_iter()
                    .partition(|(_, linked_at)| *linked_at >= since);
                Some((
                    fresh.into_iter().map(|(id, _)| id).collect::<Vec<_>>(),
                    known.into_iter().map(|(id, _)| id).collect::<Vec<_>>(),
                ))
            }
            None => None,
        };

        let types: Vec<RecordType> = match &channel_scopes {
            Some(scopes) => self
                .outgoing_order
                .iter()
                .filter(|t| scopes.contains_key(*t))
                .cloned()
                .collect(),
            None => self.outgoing_order.clone(),
        };

        let mut passes = HashMap::new();
        for record_type in &types {
            let directive = self.registry.get(record_type)?;
            let scoped = directive.build_sync_filter(&[], &config).is_some();
            let type_passes = match (&channel_scopes, &facility_scope) {
                (Some(scopes), _) => vec![Pass {
                    since,
                    scope: scopes.get(record_type).cloned().flatten(),
                }],
                (None, Some((fresh, known))) if scoped => vec![
                    Pass {
                        since: 0,
                        scope: Some(fresh.clone()),
                    },
                    Pass {
                        since,
                        scope: Some(known.clone()),
                    },
                ],
                _ => vec![Pass { since, scope: None }],
            };
            passes.insert(record_type.clone(), type_passes);
        }

        Ok(PullPlan {
            since,
            types,
            passes,
            config,
        })
    }

    /// Map channels to the types they name and, per type, the union of their
    /// parameter values. A parameter-less channel leaves its type unscoped.
    fn resolve_channels(&self, channels: &[String]) -> Result<HashMap<RecordType, Option<Vec<String>>>> {
        let mut scopes: HashMap<RecordType, Option<BTreeSet<String>>> = HashMap::new();
        for channel in channels {
            let ResolvedChannel {
                record_type,
                params,
            } = self.router.resolve(channel)?;
            if !self.outgoing_order.contains(&record_type) {
                return Err(Error::DirectionNotAllowed {
                    record_type,
                    action: "pulled",
                }
                .into());
            }
            let entry = scopes
                .entry(record_type)
                .or_insert_with(|| Some(BTreeSet::new()));
            if params.is_empty() {
                *entry = None;
            } else if let Some(ids) = entry {
                ids.extend(params.into_values());
            }
        }
        Ok(scopes
            .into_iter()
            .map(|(t, ids)| (t, ids.map(|ids| ids.into_iter().collect())))
            .collect())
    }

    async fn run_snapshot(&self, id: SessionId, plan: &PullPlan) -> Result<()> {
        self.store.delete_staging(id, Some(Direction::Outgoing)).await?;

        let graph = DependencyGraph::build_strict(&self.registry, &plan.types)?;
        let snapshotter = Snapshotter::new(
            self.store.as_ref(),
            &self.registry,
            id,
            self.settings.snapshot_batch_size,
        );
        let snapshotter = &snapshotter;
        let registry = &self.registry;

        let counts = graph
            .run(|record_type| async move {
                let directive = registry.get(&record_type)?;
                let mut staged = 0;
                for pass in plan.passes.get(&record_type).map(Vec::as_slice).unwrap_or_default() {
                    staged += snapshotter
                        .snapshot_type(directive, pass.since, pass.scope.as_deref(), &plan.config)
                        .await?;
                }
                Ok::<_, AppError>(staged)
            })
            .await?;

        let echoes = self.store.remove_echoes(id).await?;
        let staged: i64 = counts.iter().map(|(_, n)| n).sum();

        tracing::info!(
            session_id = %id,
            staged,
            echoes,
            "Snapshot completed"
        );
        Ok(())
    }

    /// Publish the capture, or discard it if the session closed meanwhile.
    async fn finish_snapshot(&self, id: SessionId) -> Result<()> {
        if self.store.complete_snapshot(id, Utc::now()).await? {
            return Ok(());
        }
        let removed = self.store.delete_staging(id, Some(Direction::Outgoing)).await?;
        tracing::warn!(
            session_id = %id,
            staging_removed = removed,
            "Session closed during snapshot, capture discarded"
        );
        Ok(())
    }

    /// Discard the partial snapshot and poison the session. The cursor is
    /// never touched.
    async fn fail_pull(&self, id: SessionId, error: &AppError) {
        if let Err(e) = self.store.delete_staging(id, Some(Direction::Outgoing)).await {
            tracing::error!(session_id = %id, error = %e, "Failed to clear outgoing staging");
        }
        self.poison(id, error).await;
    }

    /// `None` while the snapshot is still running.
    pub async fn fetch_pull_count(&self, id: SessionId) -> Result<Option<i64>> {
        let session = self.connect(id).await?;
        if session.snapshot_completed_at.is_none() {
            return Ok(None);
        }
        Ok(Some(self.store.count_staging(id, Direction::Outgoing).await?))
    }

    /// Staged outgoing rows in transmission order, after `after`.
    pub async fn outgoing_page(
        &self,
        id: SessionId,
        after: Option<StagingKey>,
        limit: Option<i64>,
    ) -> Result<PullPage> {
        let session = self.connect(id).await?;
        if session.snapshot_completed_at.is_none() {
            return Err(AppError::SnapshotInProgress(id));
        }
        let limit = limit
            .map(|l| l.clamp(1, self.settings.pull_page_max))
            .unwrap_or(self.settings.pull_page_default);

        // one extra row tells whether another page follows
        let mut rows = self
            .store
            .fetch_staging_page(id, Direction::Outgoing, &self.outgoing_order, after, limit + 1)
            .await?;
        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);

        Ok(PullPage {
            next: rows.last().map(|(key, _)| *key),
            records: rows.into_iter().map(|(_, record)| record).collect(),
            has_more,
        })
    }

    /// Commit the outgoing phase: move the outgoing cursor up to the
    /// session's tick when the cursor supplied the watermark.
    pub async fn complete_pull(&self, id: SessionId) -> Result<SyncSession> {
        let mut session = self.load_active(id).await?;
        if session.snapshot_completed_at.is_none() {
            return Err(AppError::SnapshotInProgress(id));
        }
        if session.advance_outgoing_cursor {
            self.advance_cursor(Direction::Outgoing, session.sync_tick).await?;
            session.advance_outgoing_cursor = false;
        }
        session.touch(Utc::now());
        self.store.update_session(&session).await?;
        tracing::info!(session_id = %id, sync_tick = session.sync_tick, "Pull completed");
        Ok(session)
    }

    /// Forward-only cursor move. A concurrent session that already moved the
    /// cursor further wins; that is logged, not failed.
    async fn advance_cursor(&self, direction: Direction, to: Tick) -> Result<()> {
        let mut cursor = self.cursors.use_cursor(direction).await?;
        match cursor.advance_forward(to).await {
            Err(AppError::Engine(Error::CursorRegression { current, requested })) => {
                tracing::warn!(
                    direction = direction.as_str(),
                    current,
                    requested,
                    "Cursor already past requested tick"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Validate and stage a batch of changes from the peer. A change of an
    /// unknown type, or of one this node does not accept, errors the session.
    pub async fn add_incoming_changes(&self, id: SessionId, changes: Vec<IncomingChange>) -> Result<usize> {
        let mut session = self.load_active(id).await?;
        let role = self.settings.node_role;

        let records = match changes
            .into_iter()
            .map(|change| -> Result<NewSessionRecord> {
                let directive = self.registry.get(&change.record_type)?;
                if !directive.direction.receives_at(role) {
                    return Err(Error::DirectionNotAllowed {
                        record_type: change.record_type,
                        action: "pushed",
                    }
                    .into());
                }
                directive.schema.validate_data(&change.data)?;
                Ok(change.into_staging(id))
            })
            .collect::<Result<Vec<_>>>()
        {
            Ok(records) => records,
            Err(e) => {
                if matches!(&e, AppError::Engine(engine) if engine.is_protocol()) {
                    self.poison(id, &e).await;
                }
                return Err(e);
            }
        };
        let count = records.len();

        session.transition(SessionStatus::Incoming)?;
        session.touch(Utc::now());
        self.store.insert_staging(records).await?;
        self.store.update_session(&session).await?;
        tracing::debug!(session_id = %id, count, "Staged incoming changes");
        Ok(count)
    }

    /// Merge everything staged incoming, then move the incoming cursor to
    /// `up_to_tick` when given.
    pub async fn complete_push(&self, id: SessionId, up_to_tick: Option<Tick>) -> Result<MergeReport> {
        let mut session = self.load_active(id).await?;
        session.transition(SessionStatus::Incoming)?;

        let report = match merge_incoming(
            self.store.as_ref(),
            &self.registry,
            &self.incoming_ranks,
            id,
            &self.settings.conflict_policy,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                self.poison(id, &e).await;
                return Err(e);
            }
        };

        if let Some(tick) = up_to_tick {
            self.advance_cursor(Direction::Incoming, tick).await?;
        }
        self.cache.invalidate_all();

        session.touch(Utc::now());
        self.store.update_session(&session).await?;
        Ok(report)
    }

    pub async fn channels_for_scope(&self, scope_id: &str) -> Result<Arc<Vec<String>>> {
        Ok(self.cache.channels(&self.registry, scope_id).await?)
    }

    pub fn resolve_channel(&self, channel: &str) -> Result<ResolvedChannel> {
        Ok(self.router.resolve(channel)?)
    }

    /// Close every lapsed session and drop its staging rows.
    pub async fn reap_lapsed(&self) -> Result<usize> {
        let max_idle = chrono::Duration::seconds(self.settings.lapsed_session_seconds);
        let now = Utc::now();
        let mut closed = 0;
        for id in self.store.lapsed_sessions(now - max_idle).await? {
            let Some(_claim) = SessionClaim::acquire(&self.claims, id) else {
                tracing::debug!(session_id = %id, "Lapsed session still snapshotting, skipped");
                continue;
            };
            let Some(mut session) = self.store.get_session(id).await? else {
                continue;
            };
            if !session.is_lapsed(now, max_idle) {
                continue;
            }
            self.store.delete_staging(id, None).await?;
            session.close(now)?;
            self.store.update_session(&session).await?;
            tracing::info!(session_id = %id, "Closed lapsed sync session");
            closed += 1;
        }
        Ok(closed)
    }

    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = Duration::from_secs(self.settings.lapsed_session_check_frequency_seconds);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match manager.reap_lapsed().await {
                    Ok(0) => {}
                    Ok(closed) => tracing::info!(closed, "Reaped lapsed sync sessions"),
                    Err(e) => tracing::error!(error = %e, "Failed to reap lapsed sync sessions"),
                }
            }
        })
    }
}

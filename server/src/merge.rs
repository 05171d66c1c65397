//! Applying a session's incoming staging rows to the live tables.

use crate::error::Result;
use crate::store::SyncStore;
use fieldsync_engine::{
    plan_merge, Capture, ConflictResolver, Direction, DirectiveRegistry, LocalEvidence,
    MergeReport, RecordType, SessionId,
};
use std::collections::{BTreeMap, HashMap};

/// Merge everything the peer pushed in `session_id`.
///
/// `ranks` orders types parent-first. Local evidence for conflict detection
/// comes from this session's outgoing capture and the current field sums of
/// the live rows.
pub async fn merge_incoming(
    store: &dyn SyncStore,
    registry: &DirectiveRegistry,
    ranks: &HashMap<RecordType, i32>,
    session_id: SessionId,
    resolver: &dyn ConflictResolver,
) -> Result<MergeReport> {
    let records = store.fetch_staging(session_id, Direction::Incoming).await?;
    if records.is_empty() {
        return Ok(MergeReport::default());
    }

    let captured = store.captured_sums(session_id).await?;

    let mut ids_by_type: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for record in &records {
        ids_by_type
            .entry(record.record_type.as_str())
            .or_default()
            .push(record.record_id.clone());
    }
    let mut current: HashMap<(RecordType, String), Option<i64>> = HashMap::new();
    for (record_type, ids) in ids_by_type {
        let directive = registry.get(record_type)?;
        for (id, sum) in store.current_field_sums(directive, &ids).await? {
            current.insert((record_type.to_string(), id), sum);
        }
    }

    let plan = plan_merge(
        records,
        ranks,
        |record| {
            let key = (record.record_type.clone(), record.record_id.clone());
            LocalEvidence {
                capture: captured.get(&key).map(|sum| Capture {
                    updated_at_by_field_sum: *sum,
                }),
                current_sum: current.get(&key).copied().flatten(),
            }
        },
        resolver,
    )?;

    let tock = store.tick_tock().await?.tock;
    store
        .persist_incoming(registry, session_id, &plan.to_apply, tock)
        .await?;

    let report = plan.report;
    tracing::info!(
        session_id = %session_id,
        applied = report.applied,
        echoed = report.echoed,
        skipped = report.skipped,
        conflicts = report.conflicts.len(),
        tock,
        "Merged incoming changes"
    );
    for resolved in &report.conflicts {
        tracing::warn!(
            session_id = %session_id,
            record_type = %resolved.conflict.record_type,
            record_id = %resolved.conflict.record_id,
            kind = ?resolved.conflict.kind,
            resolution = ?resolved.resolution,
            "Sync conflict"
        );
    }
    Ok(report)
}

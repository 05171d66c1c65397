//! Conflict detection for incoming merges.
//!
//! Incoming staging records are compared against two pieces of local evidence:
//! the checksum this node captured for the same record when it snapshotted
//! outgoing rows in the same session, and the checksum of the live row right
//! now. The outcome is a [`MergeDecision`]; conflicts are values, never errors.
//!
//! # Rules
//!
//! 1. No outgoing capture of the record: nothing local changed since the last
//!    exchange, the incoming row is applied.
//! 2. The live row no longer matches its capture: it was edited after the
//!    snapshot was taken ([`ConflictKind::ChangedSinceCapture`]).
//! 3. The incoming checksum equals the capture: the peer is sending back what
//!    it received, an echo.
//! 4. Otherwise both sides edited the record since the last exchange
//!    ([`ConflictKind::ConcurrentEdit`]).
//!
//! What happens to a conflict is decided by a [`ConflictResolver`].

use crate::{error::Result, Error, RecordId, RecordType, SyncSessionRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why an incoming record conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// The live row was edited after this node captured it.
    ChangedSinceCapture,
    /// Both nodes edited the record since the last exchange.
    ConcurrentEdit,
}

/// A detected conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub record_type: RecordType,
    pub record_id: RecordId,
    pub kind: ConflictKind,
    pub captured_sum: Option<i64>,
    pub local_sum: Option<i64>,
    pub incoming_sum: Option<i64>,
}

/// Checksum recorded when the record was staged outgoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub updated_at_by_field_sum: Option<i64>,
}

/// What this node knows about one record at merge time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalEvidence {
    /// `None` when the record was not staged outgoing in this session.
    pub capture: Option<Capture>,
    /// Checksum of the live row; `None` when missing or never tracked.
    pub current_sum: Option<i64>,
}

/// Outcome of detection for one incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Apply,
    Echo,
    Conflict(Conflict),
}

/// Classify one incoming record.
pub fn detect(incoming: &SyncSessionRecord, evidence: &LocalEvidence) -> MergeDecision {
    let Some(capture) = evidence.capture else {
        return MergeDecision::Apply;
    };

    let conflict = |kind| {
        MergeDecision::Conflict(Conflict {
            record_type: incoming.record_type.clone(),
            record_id: incoming.record_id.clone(),
            kind,
            captured_sum: capture.updated_at_by_field_sum,
            local_sum: evidence.current_sum,
            incoming_sum: incoming.updated_at_by_field_sum,
        })
    };

    if evidence.current_sum != capture.updated_at_by_field_sum {
        return conflict(ConflictKind::ChangedSinceCapture);
    }
    if incoming.updated_at_by_field_sum == capture.updated_at_by_field_sum {
        return MergeDecision::Echo;
    }
    conflict(ConflictKind::ConcurrentEdit)
}

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    ApplyIncoming,
    KeepLocal,
}

/// Decides the fate of detected conflicts. Resolution is a deployment
/// decision, so the merge only ever talks to this trait.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Built-in resolution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Local data stays; the conflict is reported.
    #[default]
    KeepLocal,
    /// Incoming data overwrites; the conflict is reported.
    IncomingWins,
}

impl ConflictPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keep-local" => Some(ConflictPolicy::KeepLocal),
            "incoming-wins" => Some(ConflictPolicy::IncomingWins),
            _ => None,
        }
    }
}

impl ConflictResolver for ConflictPolicy {
    fn resolve(&self, _conflict: &Conflict) -> Resolution {
        match self {
            ConflictPolicy::KeepLocal => Resolution::KeepLocal,
            ConflictPolicy::IncomingWins => Resolution::ApplyIncoming,
        }
    }
}

/// A conflict together with what was done about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConflict {
    #[serde(flatten)]
    pub conflict: Conflict,
    pub resolution: Resolution,
}

/// Summary of one incoming merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Rows written, including conflicts resolved in favour of the peer.
    pub applied: usize,
    /// Rows the peer sent back unchanged.
    pub echoed: usize,
    /// Conflicting rows left untouched.
    pub skipped: usize,
    pub conflicts: Vec<ResolvedConflict>,
}

/// Records to persist, in application order, plus the report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub to_apply: Vec<SyncSessionRecord>,
    pub report: MergeReport,
}

/// Order incoming records by dependency rank then staging id, run detection
/// on each and apply the resolver to conflicts.
///
/// A record whose type has no rank is a protocol error; the whole plan is
/// rejected.
pub fn plan_merge<F>(
    mut records: Vec<SyncSessionRecord>,
    ranks: &HashMap<RecordType, i32>,
    mut evidence: F,
    resolver: &dyn ConflictResolver,
) -> Result<MergePlan>
where
    F: FnMut(&SyncSessionRecord) -> LocalEvidence,
{
    for record in &records {
        if !ranks.contains_key(&record.record_type) {
            return Err(Error::UnknownRecordType(record.record_type.clone()));
        }
    }
    records.sort_by_key(|r| (ranks.get(&r.record_type).copied().unwrap_or(i32::MAX), r.id));

    let mut plan = MergePlan::default();
    for record in records {
        match detect(&record, &evidence(&record)) {
            MergeDecision::Apply => {
                plan.report.applied += 1;
                plan.to_apply.push(record);
            }
            MergeDecision::Echo => plan.report.echoed += 1,
            MergeDecision::Conflict(conflict) => {
                let resolution = resolver.resolve(&conflict);
                match resolution {
                    Resolution::ApplyIncoming => {
                        plan.report.applied += 1;
                        plan.to_apply.push(record);
                    }
                    Resolution::KeepLocal => plan.report.skipped += 1,
                }
                plan.report
                    .conflicts
                    .push(ResolvedConflict { conflict, resolution });
            }
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;
    use uuid::Uuid;

    fn incoming(id: i64, record_type: &str, record_id: &str, sum: Option<i64>) -> SyncSessionRecord {
        SyncSessionRecord {
            id,
            session_id: Uuid::nil(),
            direction: Direction::Incoming,
            record_type: record_type.into(),
            record_id: record_id.into(),
            is_deleted: false,
            data: serde_json::Map::new(),
            saved_at_sync_tick: None,
            updated_at_by_field_sum: sum,
        }
    }

    fn captured(sum: i64, current: i64) -> LocalEvidence {
        LocalEvidence {
            capture: Some(Capture {
                updated_at_by_field_sum: Some(sum),
            }),
            current_sum: Some(current),
        }
    }

    #[test]
    fn uncaptured_record_is_applied() {
        let record = incoming(1, "Patient", "p1", Some(10));
        assert_eq!(detect(&record, &LocalEvidence::default()), MergeDecision::Apply);
    }

    #[test]
    fn local_edit_after_capture_is_flagged() {
        let record = incoming(1, "Patient", "p1", Some(10));
        match detect(&record, &captured(10, 14)) {
            MergeDecision::Conflict(c) => {
                assert_eq!(c.kind, ConflictKind::ChangedSinceCapture);
                assert_eq!(c.captured_sum, Some(10));
                assert_eq!(c.local_sum, Some(14));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn echo_is_recognised() {
        let record = incoming(1, "Patient", "p1", Some(10));
        assert_eq!(detect(&record, &captured(10, 10)), MergeDecision::Echo);
    }

    #[test]
    fn both_sides_edited() {
        let record = incoming(1, "Patient", "p1", Some(25));
        match detect(&record, &captured(10, 10)) {
            MergeDecision::Conflict(c) => assert_eq!(c.kind, ConflictKind::ConcurrentEdit),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn policy_parse() {
        assert_eq!(ConflictPolicy::parse("keep-local"), Some(ConflictPolicy::KeepLocal));
        assert_eq!(ConflictPolicy::parse("incoming-wins"), Some(ConflictPolicy::IncomingWins));
        assert_eq!(ConflictPolicy::parse("coin-flip"), None);
    }

    #[test]
    fn plan_orders_by_rank_then_id() {
        let ranks: HashMap<RecordType, i32> = [("A".to_string(), 0), ("B".to_string(), 1)].into();
        let records = vec![
            incoming(1, "B", "b1", None),
            incoming(5, "A", "a2", None),
            incoming(3, "A", "a1", None),
        ];
        let plan = plan_merge(records, &ranks, |_| LocalEvidence::default(), &ConflictPolicy::KeepLocal)
            .unwrap();
        let ids: Vec<&str> = plan.to_apply.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);
        assert_eq!(plan.report.applied, 3);
    }

    #[test]
    fn plan_applies_policy_and_reports() {
        let ranks: HashMap<RecordType, i32> = [("Patient".to_string(), 0)].into();
        let records = vec![
            incoming(1, "Patient", "echo", Some(10)),
            incoming(2, "Patient", "clash", Some(30)),
            incoming(3, "Patient", "fresh", Some(7)),
        ];
        let evidence = |r: &SyncSessionRecord| match r.record_id.as_str() {
            "echo" => captured(10, 10),
            "clash" => captured(20, 20),
            _ => LocalEvidence::default(),
        };

        let keep = plan_merge(records.clone(), &ranks, evidence, &ConflictPolicy::KeepLocal).unwrap();
        assert_eq!(keep.report.applied, 1);
        assert_eq!(keep.report.echoed, 1);
        assert_eq!(keep.report.skipped, 1);
        assert_eq!(keep.report.conflicts[0].resolution, Resolution::KeepLocal);

        let win = plan_merge(records, &ranks, evidence, &ConflictPolicy::IncomingWins).unwrap();
        assert_eq!(win.report.applied, 2);
        assert_eq!(win.report.skipped, 0);
        assert_eq!(win.report.conflicts.len(), 1);
        assert_eq!(win.report.conflicts[0].conflict.record_id, "clash");
    }

    #[test]
    fn plan_rejects_unknown_type() {
        let ranks: HashMap<RecordType, i32> = HashMap::new();
        let err = plan_merge(
            vec![incoming(1, "Widget", "w1", None)],
            &ranks,
            |_| LocalEvidence::default(),
            &ConflictPolicy::KeepLocal,
        )
        .unwrap_err();
        assert!(err.is_protocol());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_every_record_is_accounted_for(
                sums in proptest::collection::vec((0i64..5, 0i64..5, 0i64..5, any::<bool>()), 0..40),
            ) {
                let ranks: HashMap<RecordType, i32> = [("T".to_string(), 0)].into();
                let records: Vec<_> = sums
                    .iter()
                    .enumerate()
                    .map(|(i, (incoming_sum, _, _, _))| incoming(i as i64, "T", &format!("r{i}"), Some(*incoming_sum)))
                    .collect();
                let evidence = |r: &SyncSessionRecord| {
                    let (_, capture, current, was_captured) = sums[r.id as usize];
                    if was_captured { captured(capture, current) } else { LocalEvidence::default() }
                };

                let plan = plan_merge(records, &ranks, evidence, &ConflictPolicy::KeepLocal).unwrap();
                let report = &plan.report;
                prop_assert_eq!(report.applied + report.echoed + report.skipped, sums.len());
                prop_assert_eq!(plan.to_apply.len(), report.applied);
                prop_assert_eq!(report.skipped, report.conflicts.len());
                prop_assert!(plan.to_apply.windows(2).all(|w| w[0].id < w[1].id));
            }
        }
    }
}

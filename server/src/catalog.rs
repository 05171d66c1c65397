//! The record types this server syncs.

use crate::store::SharedStore;
use fieldsync_engine::{
    Association, ChannelRoute, ChannelSource, DirectiveRegistry, Error, FieldDef, FieldType,
    ModelSchema, ModelSyncDirective, ScopeFilter, SyncDirection,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

/// Setting that makes every lab request sync to every facility.
pub const SYNC_ALL_LAB_REQUESTS: &str = "syncAllLabRequests";

const LAB_REQUEST_ROUTE: &str = "patient/:patientId/lab-request";

fn field(name: &str, field_type: FieldType) -> FieldDef {
    FieldDef::new(name, field_type)
}

fn by_patient(ids: &[String]) -> Option<ScopeFilter> {
    Some(ScopeFilter::field_in("patient_id", ids))
}

/// Lab requests go to every facility when the deployment says so, otherwise
/// they follow the patient.
struct LabRequestChannels {
    store: SharedStore,
    route: ChannelRoute,
}

impl LabRequestChannels {
    async fn compute(&self, scope_id: &str) -> fieldsync_engine::error::Result<Vec<String>> {
        let sync_all = self
            .store
            .setting(None, SYNC_ALL_LAB_REQUESTS)
            .await
            .map_err(|e| Error::ChannelSource(e.to_string()))?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if sync_all {
            return Ok(vec!["LabRequest".to_string()]);
        }
        Ok(self.route.fill_single(scope_id).into_iter().collect())
    }
}

impl ChannelSource for LabRequestChannels {
    fn channels<'a>(&'a self, scope_id: &'a str) -> BoxFuture<'a, fieldsync_engine::error::Result<Vec<String>>> {
        self.compute(scope_id).boxed()
    }
}

/// Build the registry of every known record type.
pub fn default_registry(store: SharedStore) -> fieldsync_engine::error::Result<DirectiveRegistry> {
    let reference_data = ModelSyncDirective::new(
        "ReferenceData",
        "reference_data",
        SyncDirection::PullOnly,
        ModelSchema::new(vec![
            field("id", FieldType::String),
            field("type", FieldType::String),
            field("code", FieldType::String),
            field("name", FieldType::String),
            field("visibility_status", FieldType::String),
        ]),
    );

    let facility = ModelSyncDirective::new(
        "Facility",
        "facilities",
        SyncDirection::PullOnly,
        ModelSchema::new(vec![
            field("id", FieldType::String),
            field("code", FieldType::String),
            field("name", FieldType::String),
        ]),
    );

    let patient = ModelSyncDirective::new(
        "Patient",
        "patients",
        SyncDirection::Bidirectional,
        ModelSchema::new(vec![
            field("id", FieldType::String),
            field("display_id", FieldType::String),
            field("first_name", FieldType::String),
            field("last_name", FieldType::String),
            field("sex", FieldType::String),
            field("date_of_birth", FieldType::DateString),
            field("date_of_death", FieldType::DateTimeString),
            field("village_id", FieldType::String),
            field("merged_into_id", FieldType::String),
        ])
        .with_association(Association::belongs_to("village", "ReferenceData", "village_id")),
    );

    let patient_facility = ModelSyncDirective::new(
        "PatientFacility",
        "patient_facilities",
        SyncDirection::Bidirectional,
        ModelSchema::new(vec![
            field("id", FieldType::String),
            field("patient_id", FieldType::String),
            field("facility_id", FieldType::String),
        ])
        .with_association(Association::belongs_to("patient", "Patient", "patient_id"))
        .with_association(Association::belongs_to("facility", "Facility", "facility_id")),
    )
    .with_sync_filter(|ids, _| by_patient(ids));

    let encounter = ModelSyncDirective::new(
        "Encounter",
        "encounters",
        SyncDirection::Bidirectional,
        ModelSchema::new(vec![
            field("id", FieldType::String),
            field("patient_id", FieldType::String),
            field("facility_id", FieldType::String),
            field("encounter_type", FieldType::String),
            field("start_date", FieldType::DateTimeString),
            field("end_date", FieldType::DateTimeString),
            field("reason_for_encounter", FieldType::String),
        ])
        .with_association(Association::belongs_to("patient", "Patient", "patient_id"))
        .with_association(Association::belongs_to("facility", "Facility", "facility_id"))
        .with_association(Association::has_many("lab_requests", "LabRequest", "encounter_id")),
    )
    .with_included_relation("lab_requests")
    .with_sync_filter(|ids, _| by_patient(ids));

    let patient_issue = ModelSyncDirective::new(
        "PatientIssue",
        "patient_issues",
        SyncDirection::Bidirectional,
        ModelSchema::new(vec![
            field("id", FieldType::String),
            field("patient_id", FieldType::String),
            field("type", FieldType::String),
            field("note", FieldType::String),
            field("recorded_date", FieldType::DateTimeString),
        ])
        .with_association(Association::belongs_to("patient", "Patient", "patient_id")),
    )
    .with_route("patient/:patientId/issue")?
    .with_sync_filter(|ids, _| by_patient(ids));

    let lab_request = ModelSyncDirective::new(
        "LabRequest",
        "lab_requests",
        SyncDirection::Bidirectional,
        ModelSchema::new(vec![
            field("id", FieldType::String),
            field("encounter_id", FieldType::String),
            field("display_id", FieldType::String),
            field("status", FieldType::String),
            field("requested_date", FieldType::DateTimeString),
            field("sample_time", FieldType::DateTimeString),
            field("urgent", FieldType::Bool),
        ])
        .with_association(Association::belongs_to("encounter", "Encounter", "encounter_id"))
        .with_association(Association::has_many("tests", "LabTest", "lab_request_id")),
    )
    .with_included_relation("tests")
    .with_route(LAB_REQUEST_ROUTE)?
    .with_channel_source(Arc::new(LabRequestChannels {
        store,
        route: ChannelRoute::parse(LAB_REQUEST_ROUTE)?,
    }))
    .with_sync_filter(|ids, config| {
        if config.sync_all_lab_requests {
            None
        } else {
            Some(ScopeFilter::related("encounter_id", "Encounter", "patient_id", ids))
        }
    });

    let lab_test = ModelSyncDirective::new(
        "LabTest",
        "lab_tests",
        SyncDirection::Bidirectional,
        ModelSchema::new(vec![
            field("id", FieldType::String),
            field("lab_request_id", FieldType::String),
            field("lab_test_type_id", FieldType::String),
            field("result", FieldType::String),
            field("completed_date", FieldType::DateTimeString),
        ])
        .with_association(Association::belongs_to("lab_request", "LabRequest", "lab_request_id"))
        .with_association(Association::belongs_to("lab_test_type", "ReferenceData", "lab_test_type_id")),
    );

    let local_note = ModelSyncDirective::new(
        "LocalNote",
        "local_notes",
        SyncDirection::DoNotSync,
        ModelSchema::new(vec![
            field("id", FieldType::String),
            field("content", FieldType::String),
        ]),
    );

    DirectiveRegistry::new(vec![
        reference_data,
        facility,
        patient,
        patient_facility,
        encounter,
        patient_issue,
        lab_request,
        lab_test,
        local_note,
    ])
}

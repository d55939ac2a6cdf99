//! Operation record RPCs, dispatched to the typed store by kind.

use crate::error::{Result, WaystationError};
use crate::grpc::convert::{self, WireOperation};
use crate::ops::{
    generate_id, ApplicationRef, Artifact, Build, Deployment, OperationKind, Release,
    StatusReport,
};
use crate::proto;
use crate::proto::operation_record::Record;
use crate::state::{OperationOrder, StateStore, StatusFilter};

/// Evaluate `$body` with `$t` bound to the record type of `$kind`.
macro_rules! with_kind {
    ($kind:expr, $t:ident => $body:expr) => {
        match $kind {
            OperationKind::Build => {
                type $t = Build;
                $body
            }
            OperationKind::Artifact => {
                type $t = Artifact;
                $body
            }
            OperationKind::Deployment => {
                type $t = Deployment;
                $body
            }
            OperationKind::Release => {
                type $t = Release;
                $body
            }
            OperationKind::StatusReport => {
                type $t = StatusReport;
                $body
            }
        }
    };
}

/// Insert when the id is empty (generating one), otherwise update the existing record.
fn upsert<T: WireOperation>(state: &StateStore, mut record: T) -> Result<proto::OperationRecord> {
    let update = !record.id().is_empty();
    if !update {
        record.set_id(generate_id());
    }
    state.operation_put(update, &record)?;
    Ok(record.to_record())
}

pub fn upsert_operation(
    state: &StateStore,
    request: proto::UpsertOperationRequest,
) -> Result<proto::OperationRecord> {
    let record = request
        .record
        .and_then(|r| r.record)
        .ok_or_else(|| WaystationError::precondition("operation record must be set"))?;
    match record {
        Record::Build(b) => upsert(state, convert::build_from_proto(b)?),
        Record::Artifact(a) => upsert(state, convert::artifact_from_proto(a)?),
        Record::Deployment(d) => upsert(state, convert::deployment_from_proto(d)?),
        Record::Release(r) => upsert(state, convert::release_from_proto(r)?),
        Record::StatusReport(s) => upsert(state, convert::status_report_from_proto(s)?),
    }
}

pub fn get_operation(
    state: &StateStore,
    request: proto::GetOperationRequest,
) -> Result<proto::OperationRecord> {
    let kind = convert::kind_from_proto(request.kind)?;
    with_kind!(kind, T => state.operation_get::<T>(&request.id).map(|r| r.to_record()))
}

fn list<T: WireOperation>(
    state: &StateStore,
    app: &ApplicationRef,
    filter: &StatusFilter,
    order: &OperationOrder,
) -> Result<Vec<proto::OperationRecord>> {
    Ok(state
        .operation_list::<T>(app, filter, order)?
        .iter()
        .map(WireOperation::to_record)
        .collect())
}

pub fn list_operations(
    state: &StateStore,
    request: proto::ListOperationsRequest,
) -> Result<proto::ListOperationsResponse> {
    let kind = convert::kind_from_proto(request.kind)?;
    let app = convert::app_from_proto(request.application)?;
    let filter = convert::filters_from_proto(request.filters);
    let order = convert::order_from_proto(request.order);

    let records = with_kind!(kind, T => list::<T>(state, &app, &filter, &order))?;
    Ok(proto::ListOperationsResponse { records })
}

pub fn get_latest_operation(
    state: &StateStore,
    request: proto::GetLatestOperationRequest,
) -> Result<proto::OperationRecord> {
    let kind = convert::kind_from_proto(request.kind)?;
    let app = convert::app_from_proto(request.application)?;
    let latest = with_kind!(kind, T => state.operation_latest::<T>(&app)?.map(|r| r.to_record()));
    latest.ok_or_else(|| WaystationError::not_found(format!("successful {} for {}", kind, app)))
}

//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::api::Condition;

/// Condition types set by the reconcilers
pub const API_EXPORT_VALID: &str = "APIExportValid";
pub const BINDING_UP_TO_DATE: &str = "BindingUpToDate";
pub const PERMISSION_CLAIMS_VALID: &str = "PermissionClaimsValid";
pub const API_EXPORT_ENDPOINT_SLICE_URLS_READY: &str = "APIExportEndpointSliceURLsReady";

/// Reasons attached to False conditions
pub const REASON_API_EXPORT_NOT_FOUND: &str = "APIExportNotFound";
pub const REASON_INTERNAL_ERROR: &str = "InternalError";
pub const REASON_ERROR_GENERATING_URLS: &str = "ErrorGeneratingURLs";
pub const REASON_NAMING_CONFLICT: &str = "NamingConflict";
pub const REASON_WAITING_FOR_ESTABLISHED: &str = "WaitingForEstablished";
pub const REASON_UNKNOWN_CLAIM: &str = "UnknownClaim";
pub const REASON_CLAIM_NOT_ACCEPTED: &str = "ClaimNotAccepted";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Update or add a condition to the conditions list
///
/// If a condition with the same type exists and has different status/reason/message,
/// it will be updated; the transition time only moves when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let should_update_time = existing.status != status;

        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();

        if should_update_time {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Mark a condition True, clearing any reason and message.
pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set_condition(conditions, type_, CONDITION_STATUS_TRUE, "", "");
}

/// Mark a condition False with a reason and message.
pub fn mark_false(conditions: &mut Vec<Condition>, type_: &str, reason: &str, message: &str) {
    set_condition(conditions, type_, CONDITION_STATUS_FALSE, reason, message);
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

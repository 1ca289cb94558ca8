//! Validating admission webhook for HostPathProvisioner
//!
//! Creates and updates are decoded and checked with [`validate`]. Deletes are
//! always allowed, so a broken spec can still be removed.

use crate::crd::{validate, HostPathProvisionerSpec};
use crate::error::{Error, Result};
use axum::Json;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, info, warn};

/// Path the ValidatingWebhookConfiguration points at
pub const VALIDATE_PATH: &str = "/validate-hostpathprovisioner";

pub async fn validate_handler(
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(review_response(review).into_review())
}

/// Answer one admission review
pub fn review_response(review: AdmissionReview<DynamicObject>) -> AdmissionResponse {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed admission review");
            return AdmissionResponse::invalid(e.to_string());
        }
    };
    let response = AdmissionResponse::from(&request);

    if matches!(request.operation, Operation::Delete | Operation::Connect) {
        debug!(uid = %request.uid, "Allowing {:?}", request.operation);
        return response;
    }
    let verdict = request
        .object
        .as_ref()
        .ok_or_else(|| Error::Validation("request carries no object".to_string()))
        .and_then(spec_of)
        .and_then(|spec| validate(&spec));
    match verdict {
        Ok(()) => {
            debug!(uid = %request.uid, name = %request.name, "Admitted");
            response
        }
        Err(e) => {
            info!(uid = %request.uid, name = %request.name, reason = %e, "Rejected");
            response.deny(e.to_string())
        }
    }
}

fn spec_of(obj: &DynamicObject) -> Result<HostPathProvisionerSpec> {
    let spec = obj
        .data
        .get("spec")
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    Ok(serde_json::from_value(spec)?)
}

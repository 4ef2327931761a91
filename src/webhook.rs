//! Validating admission webhook for `ImageBasedUpgrade` updates.
//!
//! Rejects changes to immutable fields while an upgrade is in progress. The
//! controller runs the same check, so the webhook only moves the rejection
//! forward to admission time.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::routing::post;
use axum_server::tls_rustls::RustlsConfig;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, error, info, warn};

use crate::crd::ImageBasedUpgrade;
use crate::validation::validate_update;

pub const VALIDATE_PATH: &str = "/validate-imagebasedupgrade";

fn typed(obj: &DynamicObject) -> Result<ImageBasedUpgrade, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

/// Decide a single admission request.
pub fn review(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    if request.operation != Operation::Update {
        return response;
    }

    let (Some(old), Some(new)) = (&request.old_object, &request.object) else {
        debug!(uid = %request.uid, "Update without both objects, allowing");
        return response;
    };
    let (old, new) = match (typed(old), typed(new)) {
        (Ok(old), Ok(new)) => (old, new),
        (Err(e), _) | (_, Err(e)) => {
            warn!(uid = %request.uid, error = %e, "Failed to decode ImageBasedUpgrade");
            return response.deny(format!("failed to decode ImageBasedUpgrade: {e}"));
        }
    };

    match validate_update(&old, &new) {
        Ok(()) => response,
        Err(message) => {
            info!(uid = %request.uid, name = %request.name, "Denying update: {}", message);
            response.deny(message)
        }
    }
}

async fn validate_handler(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review(&request).into_review())
}

fn router() -> Router {
    Router::new().route(VALIDATE_PATH, post(validate_handler))
}

/// Serve the webhook over TLS with the given PEM certificate and key.
pub async fn serve(port: u16, cert: &Path, key: &Path) -> anyhow::Result<()> {
    let tls = RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| format!("Failed to load webhook certificate {}", cert.display()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Admission webhook listening on port {}", port);
    axum_server::bind_rustls(addr, tls)
        .serve(router().into_make_service())
        .await
        .context("Admission webhook server failed")?;
    Ok(())
}

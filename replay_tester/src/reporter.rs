use async_trait::async_trait;
use litter_watch::dispatcher::{CreateIncidentResponse, UploadedArtifact};
use litter_watch::incident::MediaKind;
use litter_watch::{Incident, ReportingApi, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Reporting backend stand-in: accepts everything and logs what it would have sent.
#[derive(Default)]
pub struct LoggingApi {
    uploaded_bytes: AtomicU64,
}

#[async_trait]
impl ReportingApi for LoggingApi {
    async fn create_incident(&self, incident: &Incident) -> Result<CreateIncidentResponse> {
        info!(
            incident_id = %incident.incident_id,
            garbage_type = %incident.garbage_type,
            confidence = incident.confidence,
            partial = incident.evidence.is_partial(),
            record = %serde_json::to_string(incident)?,
            "Incident reported"
        );
        Ok(CreateIncidentResponse {
            incident_id: incident.incident_id.to_string(),
            accepted: true,
        })
    }

    async fn upload_artifact(&self, bytes: Vec<u8>, kind: MediaKind, file_name: &str) -> Result<UploadedArtifact> {
        let total = self.uploaded_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
        info!(file_name, ?kind, bytes = bytes.len(), total, "Artifact uploaded");
        Ok(UploadedArtifact {
            url: format!("replay://{file_name}"),
        })
    }
}

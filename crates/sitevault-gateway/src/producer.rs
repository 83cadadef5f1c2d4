use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sitevault_core::config::ProducerConfig;
use sitevault_core::types::JobId;
use sitevault_scheduler::{BackupProducer, BackupRequest, BackupType, ProducerError};
use tracing::{debug, warn};

use crate::auth::{sign, SIGNATURE_HEADER};

/// Asks the site's own agent (the WordPress plugin) to run the backup.
///
/// The request is authenticated with the site credential as bearer token and
/// signed like the callbacks the agent sends back.
pub struct HttpProducer {
    client: reqwest::Client,
    endpoint_path: String,
    callback_base_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunBody<'a> {
    job_id: &'a JobId,
    #[serde(rename = "type")]
    backup_type: BackupType,
    parent_backup_id: Option<&'a JobId>,
    callback_url: Option<String>,
}

impl HttpProducer {
    pub fn new(config: &ProducerConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint_path: config.endpoint_path.clone(),
            callback_base_url: config
                .callback_base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    fn endpoint(&self, site_url: &str) -> String {
        format!("{}{}", site_url.trim_end_matches('/'), self.endpoint_path)
    }

    fn callback_url(&self, job_id: &JobId) -> Option<String> {
        self.callback_base_url
            .as_ref()
            .map(|base| format!("{base}/jobs/{job_id}/events"))
    }
}

#[async_trait]
impl BackupProducer for HttpProducer {
    fn name(&self) -> &str {
        "http"
    }

    async fn run(&self, request: &BackupRequest) -> Result<(), ProducerError> {
        let body = RunBody {
            job_id: &request.job_id,
            backup_type: request.kind.backup_type(),
            parent_backup_id: request.kind.parent(),
            callback_url: self.callback_url(&request.job_id),
        };
        let payload =
            serde_json::to_vec(&body).map_err(|e| ProducerError::Unreachable(e.to_string()))?;
        let signature = sign(&payload, &request.site.credential)
            .map_err(|e| ProducerError::Unreachable(e.to_string()))?;
        let url = self.endpoint(&request.site.url);

        debug!(job_id = %request.job_id, %url, "requesting backup from site agent");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&request.site.credential)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(payload)
            .send()
            .await
            .map_err(|e| ProducerError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(job_id = %request.job_id, status, body = %text, "site agent refused backup");
            return Err(ProducerError::Rejected { status, body: text });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_endpoint_and_callback_urls() {
        let producer = HttpProducer::new(&ProducerConfig {
            endpoint_path: "/wp-json/sitevault/v1/backup".into(),
            timeout_secs: 5,
            callback_base_url: Some("https://vault.example.com/".into()),
        })
        .unwrap();

        assert_eq!(
            producer.endpoint("https://blog.example.com/"),
            "https://blog.example.com/wp-json/sitevault/v1/backup"
        );
        assert_eq!(
            producer.callback_url(&JobId::from("j1")).as_deref(),
            Some("https://vault.example.com/jobs/j1/events")
        );
    }

    #[test]
    fn run_body_wire_format() {
        let parent = JobId::from("p1");
        let body = RunBody {
            job_id: &JobId::from("j2"),
            backup_type: BackupType::Incremental,
            parent_backup_id: Some(&parent),
            callback_url: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "incremental");
        assert_eq!(json["parent_backup_id"], "p1");
        assert_eq!(json["job_id"], "j2");
    }
}

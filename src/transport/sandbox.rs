//! Sandbox transport: logs deliveries instead of sending them.

use async_trait::async_trait;
use tracing::info;

use crate::error::TransportError;
use crate::mail::Job;
use crate::transport::Transport;

pub struct SandboxTransport {
    name: String,
}

impl SandboxTransport {
    pub fn new(domain: &str) -> Self {
        Self {
            name: format!("sandbox:{domain}"),
        }
    }
}

#[async_trait]
impl Transport for SandboxTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, job: &Job) -> Result<String, TransportError> {
        let idem_key = job.idem_key();
        info!(
            transport = %self.name,
            idem_key = %idem_key,
            to = %job.to_addr,
            subject = %job.subject,
            attachments = job.attachments.len(),
            "Sandbox delivery"
        );
        Ok(format!("sandbox-{idem_key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_synthetic_id() {
        let transport = SandboxTransport::new("mail.example.com");
        let job = Job::new("k", "a@example.com", "Hi", 0).with_text_body("x");
        let id = transport.send(&job).await.unwrap();
        assert_eq!(id, format!("sandbox-{}", job.idem_key()));
    }
}

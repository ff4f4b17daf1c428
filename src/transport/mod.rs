//! Outbound delivery: the `Transport` trait and per-domain routing.

pub mod sandbox;
pub mod smtp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::MailerConfig;
use crate::error::{ConfigError, TransportError};
use crate::mail::Job;

pub use sandbox::SandboxTransport;
pub use smtp::SmtpTransport;

/// A way to deliver one job.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Deliver the job. Returns the provider's message id.
    async fn send(&self, job: &Job) -> Result<String, TransportError>;
}

/// Picks a transport by the job's routing domain.
pub struct TransportRouter {
    routes: HashMap<String, Arc<dyn Transport>>,
    default_domain: String,
    default: Arc<dyn Transport>,
}

impl TransportRouter {
    /// Fails if `default_domain` has no transport.
    pub fn new(
        routes: HashMap<String, Arc<dyn Transport>>,
        default_domain: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let default_domain = default_domain.into();
        let default = routes
            .get(&default_domain)
            .cloned()
            .ok_or_else(|| ConfigError::MissingDefaultTransport(default_domain.clone()))?;
        Ok(Self {
            routes,
            default_domain,
            default,
        })
    }

    /// One transport per configured domain: SMTP when a relay is
    /// configured, the sandbox otherwise.
    pub fn from_config(config: &MailerConfig) -> Result<Self, ConfigError> {
        let mut routes: HashMap<String, Arc<dyn Transport>> = HashMap::new();
        for domain in &config.domains {
            let transport: Arc<dyn Transport> = match &config.smtp {
                Some(smtp) => Arc::new(SmtpTransport::new(smtp, domain)?),
                None => Arc::new(SandboxTransport::new(domain)),
            };
            info!(domain = %domain, transport = transport.name(), "Registered mail domain");
            routes.insert(domain.clone(), transport);
        }
        let default_domain = config
            .default_domain()
            .ok_or_else(|| ConfigError::MissingEnvVar("MAIL_DOMAINS".into()))?;
        Self::new(routes, default_domain)
    }

    pub fn default_domain(&self) -> &str {
        &self.default_domain
    }

    /// Transport for `domain`, and whether the default was substituted.
    pub fn resolve(&self, domain: Option<&str>) -> (Arc<dyn Transport>, bool) {
        match domain.and_then(|d| self.routes.get(d)) {
            Some(transport) => (Arc::clone(transport), false),
            None => (Arc::clone(&self.default), true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TransportRouter {
        let mut routes: HashMap<String, Arc<dyn Transport>> = HashMap::new();
        routes.insert(
            "mail.example.com".into(),
            Arc::new(SandboxTransport::new("mail.example.com")),
        );
        routes.insert(
            "news.example.com".into(),
            Arc::new(SandboxTransport::new("news.example.com")),
        );
        TransportRouter::new(routes, "mail.example.com").unwrap()
    }

    #[test]
    fn resolves_known_domain() {
        let (transport, used_default) = router().resolve(Some("news.example.com"));
        assert_eq!(transport.name(), "sandbox:news.example.com");
        assert!(!used_default);
    }

    #[test]
    fn falls_back_to_default() {
        let router = router();
        for domain in [None, Some("unknown.example.com")] {
            let (transport, used_default) = router.resolve(domain);
            assert_eq!(transport.name(), "sandbox:mail.example.com");
            assert!(used_default);
        }
        assert_eq!(router.default_domain(), "mail.example.com");
    }

    #[test]
    fn missing_default_is_config_error() {
        let err = TransportRouter::new(HashMap::new(), "mail.example.com").err().unwrap();
        assert!(matches!(err, ConfigError::MissingDefaultTransport(d) if d == "mail.example.com"));
    }

    #[test]
    fn config_without_domains_is_rejected() {
        let mut config = MailerConfig::from_lookup(|key: &str| match key {
            "MAIL_SEND_TIMER" => Some("60".to_string()),
            "MAIL_DOMAINS" => Some("mail.example.com".to_string()),
            "HMAC_SECRET" => Some("s3cret".to_string()),
            _ => None,
        })
        .unwrap();
        assert!(TransportRouter::from_config(&config).is_ok());

        config.domains.clear();
        let err = TransportRouter::from_config(&config).err().unwrap();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "MAIL_DOMAINS"));
    }
}

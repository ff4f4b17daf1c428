//! Job record, lifecycle state, and the wire-level submission request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::attachments::Attachment;
use crate::error::ValidationError;

/// Lifecycle state of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Waiting for its first attempt.
    Unsent,
    /// Claimed by the dispatcher, send in flight.
    InProgress,
    /// Last attempt failed; retried while under the attempt ceiling.
    Failed,
    /// Delivered. Terminal.
    Sent,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Unsent,
        JobState::InProgress,
        JobState::Failed,
        JobState::Sent,
    ];

    /// The value persisted in the `state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Unsent => "unsent",
            JobState::InProgress => "inprog",
            JobState::Failed => "failed",
            JobState::Sent => "sent",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Sent)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsent" => Ok(JobState::Unsent),
            "inprog" => Ok(JobState::InProgress),
            "failed" => Ok(JobState::Failed),
            "sent" => Ok(JobState::Sent),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Derive the idempotency key: lowercase hex SHA-256 over
/// `job_key || to_addr || subject`.
pub fn idem_key(job_key: &str, to_addr: &str, subject: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_key.as_bytes());
    hasher.update(to_addr.as_bytes());
    hasher.update(subject.as_bytes());
    hex::encode(hasher.finalize())
}

/// One scheduled email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_key: String,
    pub subscription_key: Option<String>,
    pub missive_key: Option<String>,
    pub to_addr: String,
    pub to_name: Option<String>,
    pub from_addr: Option<String>,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Epoch seconds at which the job becomes eligible.
    pub send_at: i64,
    /// Outbound domain used to pick a transport.
    pub routing_domain: Option<String>,
    pub state: JobState,
    pub try_count: u32,
}

impl Job {
    /// A fresh, unsent job with no optional fields set.
    pub fn new(
        job_key: impl Into<String>,
        to_addr: impl Into<String>,
        subject: impl Into<String>,
        send_at: i64,
    ) -> Self {
        Self {
            job_key: job_key.into(),
            subscription_key: None,
            missive_key: None,
            to_addr: to_addr.into(),
            to_name: None,
            from_addr: None,
            from_name: None,
            reply_to: None,
            subject: subject.into(),
            html_body: None,
            text_body: None,
            attachments: Vec::new(),
            send_at,
            routing_domain: None,
            state: JobState::Unsent,
            try_count: 0,
        }
    }

    pub fn with_text_body(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }

    pub fn with_html_body(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_subscription_key(mut self, key: impl Into<String>) -> Self {
        self.subscription_key = Some(key.into());
        self
    }

    pub fn with_missive_key(mut self, key: impl Into<String>) -> Self {
        self.missive_key = Some(key.into());
        self
    }

    pub fn with_routing_domain(mut self, domain: impl Into<String>) -> Self {
        self.routing_domain = Some(domain.into());
        self
    }

    /// Storage identity of this job.
    pub fn idem_key(&self) -> String {
        idem_key(&self.job_key, &self.to_addr, &self.subject)
    }

    /// Convert a wire request into a job, normalizing empty strings to `None`.
    pub fn from_request(req: MailRequest) -> Result<Self, ValidationError> {
        if req.job_key.is_empty() {
            return Err(ValidationError::MissingField("job_key"));
        }
        if req.to_addr.is_empty() {
            return Err(ValidationError::MissingField("to_addr"));
        }
        if req.title.is_empty() {
            return Err(ValidationError::MissingField("title"));
        }
        if req.html_body.is_empty() && req.text_body.is_empty() {
            return Err(ValidationError::MissingBody);
        }
        if !req.send_at.is_finite() {
            return Err(ValidationError::InvalidSendAt(req.send_at));
        }

        Ok(Self {
            job_key: req.job_key,
            subscription_key: non_empty(req.sub),
            missive_key: non_empty(req.missive),
            to_addr: req.to_addr,
            to_name: non_empty(req.to_name),
            from_addr: non_empty(req.from_addr),
            from_name: non_empty(req.from_name),
            reply_to: non_empty(req.reply_to),
            subject: req.title,
            html_body: non_empty(req.html_body),
            text_body: non_empty(req.text_body),
            attachments: req.attachments,
            // Fractional seconds are dropped.
            send_at: req.send_at as i64,
            routing_domain: non_empty(req.domain),
            state: JobState::Unsent,
            try_count: 0,
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// JSON body of a job submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailRequest {
    #[serde(default)]
    pub job_key: String,
    #[serde(default)]
    pub to_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_to: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub html_body: String,
    #[serde(default)]
    pub text_body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub send_at: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub missive: String,
}

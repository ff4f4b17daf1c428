//! Mail job data model and attachment codec.

pub mod attachments;
pub mod model;

pub use attachments::Attachment;
pub use model::{Job, JobState, MailRequest, idem_key};

//! Outbound mail transport abstraction

use async_trait::async_trait;
use mailcast_common::config::{ProviderConfig, ProviderKind};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{EmailJob, PreparedAttachment, CAMPAIGN_ID_ARG};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::sendgrid::SendGridMailer;
use super::smtp::SmtpMailer;

/// One message handed to the mail provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<PreparedAttachment>,
    /// Echoed back by the provider in every delivery event
    pub custom_args: BTreeMap<String, String>,
}

impl OutboundEmail {
    pub fn campaign_id(&self) -> Option<&str> {
        self.custom_args.get(CAMPAIGN_ID_ARG).map(String::as_str)
    }
}

impl From<&EmailJob> for OutboundEmail {
    fn from(job: &EmailJob) -> Self {
        let mut custom_args = job.custom_args.clone();
        custom_args
            .entry(CAMPAIGN_ID_ARG.to_string())
            .or_insert_with(|| job.campaign_id.to_string());

        Self {
            to: job.to_address.clone(),
            from: job.from_address.clone(),
            subject: job.subject.clone(),
            text: job.text_body.clone(),
            html: job.html_body.clone(),
            attachments: job.attachments.clone(),
            custom_args,
        }
    }
}

/// Provider acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider message id, when the provider returns one
    pub message_id: Option<String>,
}

/// Send failures, classified for the retry policy
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The message can never be sent as built
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The provider refused the message
    #[error("provider rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The provider is throttling or failing
    #[error("provider unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    /// Network or protocol failure before a response
    #[error("transport error: {0}")]
    Transport(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Unavailable { .. } | SendError::Transport(_))
    }

    /// Classify an HTTP status returned by the provider
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || status >= 500 {
            SendError::Unavailable { status, message }
        } else {
            SendError::Rejected { status, message }
        }
    }
}

/// Mail transport
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<SendReceipt, SendError>;

    /// Short transport name for logs
    fn name(&self) -> &'static str;
}

/// Accepts every message and logs it
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<SendReceipt, SendError> {
        info!(
            to = %email.to,
            from = %email.from,
            subject = %email.subject,
            campaign_id = email.campaign_id().unwrap_or("none"),
            attachments = email.attachments.len(),
            "email accepted by log transport"
        );
        Ok(SendReceipt::default())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Build the transport selected in configuration
pub fn build_mailer(config: &ProviderConfig) -> Result<Arc<dyn Mailer>> {
    match config.kind {
        ProviderKind::Sendgrid => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                Error::Config("provider.api_key is required for the sendgrid provider".to_string())
            })?;
            Ok(Arc::new(SendGridMailer::new(
                &config.api_url,
                api_key,
                config.verified_sender.clone(),
                config.timeout(),
            )?))
        }
        ProviderKind::Smtp => Ok(Arc::new(SmtpMailer::new(
            config.smtp.clone(),
            config.verified_sender.clone(),
            config.timeout(),
        )?)),
        ProviderKind::Log => {
            warn!("using log mail transport, no email will leave this process");
            Ok(Arc::new(LogMailer))
        }
    }
}

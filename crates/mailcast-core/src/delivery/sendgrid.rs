//! SendGrid v3 HTTP transport

use async_trait::async_trait;
use mailcast_common::{Error, Result};
use mailcast_storage::models::PreparedAttachment;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::mailer::{Mailer, OutboundEmail, SendError, SendReceipt};

const SEND_PATH: &str = "/v3/mail/send";

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct Toggle {
    enable: bool,
}

#[derive(Debug, Serialize)]
struct TrackingSettings {
    click_tracking: Toggle,
    open_tracking: Toggle,
}

impl TrackingSettings {
    fn enabled() -> Self {
        Self {
            click_tracking: Toggle { enable: true },
            open_tracking: Toggle { enable: true },
        }
    }
}

/// Request body of `POST /v3/mail/send`
#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "no_attachments")]
    attachments: &'a [PreparedAttachment],
    custom_args: &'a BTreeMap<String, String>,
    tracking_settings: TrackingSettings,
}

fn no_attachments(attachments: &&[PreparedAttachment]) -> bool {
    attachments.is_empty()
}

/// SendGrid mail transport
pub struct SendGridMailer {
    client: Client,
    base_url: String,
    api_key: String,
    verified_sender: Option<String>,
}

impl SendGridMailer {
    pub fn new(
        base_url: &str,
        api_key: String,
        verified_sender: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            verified_sender,
        })
    }

    /// Sender actually used: the verified sender wins over the campaign's
    fn sender<'a>(&'a self, email: &'a OutboundEmail) -> &'a str {
        self.verified_sender.as_deref().unwrap_or(&email.from)
    }

    fn build_request<'a>(&'a self, email: &'a OutboundEmail) -> SendRequest<'a> {
        let mut content = vec![Content {
            content_type: "text/plain",
            value: &email.text,
        }];
        if let Some(html) = &email.html {
            content.push(Content {
                content_type: "text/html",
                value: html,
            });
        }

        SendRequest {
            personalizations: vec![Personalization {
                to: vec![Address { email: &email.to }],
            }],
            from: Address {
                email: self.sender(email),
            },
            subject: &email.subject,
            content,
            attachments: &email.attachments,
            custom_args: &email.custom_args,
            tracking_settings: TrackingSettings::enabled(),
        }
    }
}

#[async_trait]
impl Mailer for SendGridMailer {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<SendReceipt, SendError> {
        if email.to.trim().is_empty() {
            return Err(SendError::InvalidMessage("missing recipient".to_string()));
        }
        if email.campaign_id().is_none() {
            warn!(to = %email.to, "sending without campaign id, events will not be tracked");
        }

        let url = format!("{}{}", self.base_url, SEND_PATH);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(email))
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .headers()
                .get("x-message-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            debug!(to = %email.to, ?message_id, "email accepted by sendgrid");
            return Ok(SendReceipt { message_id });
        }

        let body = response.text().await.unwrap_or_default();
        Err(SendError::from_status(status.as_u16(), body))
    }

    fn name(&self) -> &'static str {
        "sendgrid"
    }
}

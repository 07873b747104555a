//! SMTP relay transport
//!
//! Tracking instructions and custom args travel in the `X-SMTPAPI` header
//! understood by SendGrid-compatible relays.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lettre::{
    message::{
        header::{ContentType, Header, HeaderName, HeaderValue},
        Attachment, Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailcast_common::config::SmtpRelayConfig;
use mailcast_common::{Error, Result};
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::mailer::{Mailer, OutboundEmail, SendError, SendReceipt};

/// `X-SMTPAPI` header
#[derive(Debug, Clone)]
struct XSmtpApi(String);

impl Header for XSmtpApi {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-SMTPAPI")
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// SMTP relay mail transport
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    verified_sender: Option<String>,
}

impl SmtpMailer {
    pub fn new(
        config: SmtpRelayConfig,
        verified_sender: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        } else {
            Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host))
        }
        .map_err(|e| Error::Config(format!("Failed to create SMTP transport: {}", e)))?;

        let mut builder = builder.port(config.port).timeout(Some(timeout));
        if let (Some(username), Some(password)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
            host: config.host,
            verified_sender,
        })
    }

    pub(crate) fn build_message(&self, email: &OutboundEmail) -> std::result::Result<Message, SendError> {
        let from_address = self.verified_sender.as_deref().unwrap_or(&email.from);
        let from: Mailbox = from_address
            .parse()
            .map_err(|e| SendError::InvalidMessage(format!("Invalid from address: {}", e)))?;
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| SendError::InvalidMessage(format!("Invalid to address: {}", e)))?;

        let smtp_api = json!({
            "unique_args": email.custom_args,
            "filters": {
                "clicktrack": { "settings": { "enable": 1 } },
                "opentrack": { "settings": { "enable": 1 } }
            }
        });

        let mut body = match &email.html {
            Some(html) => MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
                email.text.clone(),
                html.clone(),
            )),
            None => MultiPart::mixed().singlepart(SinglePart::plain(email.text.clone())),
        };

        for attachment in &email.attachments {
            let content = STANDARD.decode(&attachment.content).map_err(|e| {
                SendError::InvalidMessage(format!(
                    "Attachment {} is not valid base64: {}",
                    attachment.filename, e
                ))
            })?;
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                SendError::InvalidMessage(format!(
                    "Attachment {} has invalid content type: {}",
                    attachment.filename, e
                ))
            })?;
            body = body.singlepart(Attachment::new(attachment.filename.clone()).body(content, content_type));
        }

        let domain = from.email.domain().to_string();
        Message::builder()
            .from(from)
            .to(to)
            .subject(&email.subject)
            .message_id(Some(format!("<{}@{}>", Uuid::new_v4(), domain)))
            .header(XSmtpApi(smtp_api.to_string()))
            .multipart(body)
            .map_err(|e| SendError::InvalidMessage(format!("Failed to build email: {}", e)))
    }
}

fn classify(e: lettre::transport::smtp::Error) -> SendError {
    let status = e
        .status()
        .and_then(|code| code.to_string().parse::<u16>().ok());

    match status {
        Some(status) if e.is_permanent() => SendError::Rejected {
            status,
            message: e.to_string(),
        },
        Some(status) if e.is_transient() => SendError::Unavailable {
            status,
            message: e.to_string(),
        },
        _ => SendError::Transport(e.to_string()),
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<SendReceipt, SendError> {
        let message = self.build_message(email)?;
        let message_id = message
            .headers()
            .get_raw("Message-ID")
            .map(str::to_string);

        let response = self.transport.send(message).await.map_err(classify)?;
        debug!(to = %email.to, relay = %self.host, code = %response.code(), "email accepted by relay");

        Ok(SendReceipt { message_id })
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::job_for;
    use mailcast_storage::models::PreparedAttachment;
    use uuid::Uuid;

    fn mailer(verified_sender: Option<&str>) -> SmtpMailer {
        SmtpMailer::new(
            SmtpRelayConfig {
                host: "localhost".to_string(),
                port: 2525,
                use_tls: false,
                use_starttls: false,
                ..SmtpRelayConfig::default()
            },
            verified_sender.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_message_carries_tracking_header() {
        let campaign = Uuid::new_v4();
        let mut job = job_for(campaign, "a@example.com");
        job.html_body = Some("<p>Hi</p>".to_string());
        job.attachments.push(PreparedAttachment {
            content: STANDARD.encode(b"report"),
            filename: "report.txt".to_string(),
            content_type: "application/octet-stream".to_string(),
            disposition: "attachment".to_string(),
        });

        let message = mailer(Some("verified@example.com"))
            .build_message(&OutboundEmail::from(&job))
            .unwrap();
        let smtp_api: serde_json::Value =
            serde_json::from_str(message.headers().get_raw("X-SMTPAPI").unwrap()).unwrap();
        assert_eq!(smtp_api["unique_args"]["campaignId"], campaign.to_string());
        assert_eq!(smtp_api["filters"]["clicktrack"]["settings"]["enable"], 1);
        assert_eq!(smtp_api["filters"]["opentrack"]["settings"]["enable"], 1);

        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("From: verified@example.com"));
        assert!(raw.contains("report.txt"));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let job = job_for(Uuid::new_v4(), "not an address");
        let err = mailer(None)
            .build_message(&OutboundEmail::from(&job))
            .unwrap_err();
        assert!(matches!(err, SendError::InvalidMessage(_)));
        assert!(!err.is_retryable());
    }
}

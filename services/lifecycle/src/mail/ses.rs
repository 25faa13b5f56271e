use super::{EmailMessage, Mailer};
use crate::config::MailConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sesv2::config::Builder as SesConfigBuilder;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use aws_sdk_sesv2::Client as SesClient;
use tracing::{debug, info, instrument};

const CHARSET: &str = "UTF-8";

/// Mailer delivering through Amazon SES (or LocalStack)
pub struct SesMailer {
    client: SesClient,
}

impl SesMailer {
    pub async fn new(config: &MailConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut ses_config_builder = SesConfigBuilder::from(&aws_config);

        // Custom endpoint for LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            ses_config_builder = ses_config_builder.endpoint_url(endpoint_url);
        }

        let client = SesClient::from_conf(ses_config_builder.build());

        info!(region = %config.region, sender = %config.sender, "SES mailer initialized");

        Ok(Self::from_client(client))
    }

    pub fn from_client(client: SesClient) -> Self {
        Self { client }
    }
}

/// Simple (non-templated) plain-text content for one message
fn email_content(message: &EmailMessage) -> Result<EmailContent> {
    let subject = text(&message.subject)?;
    let body = Body::builder().text(text(&message.body)?).build();

    Ok(EmailContent::builder()
        .simple(Message::builder().subject(subject).body(body).build())
        .build())
}

fn text(data: &str) -> Result<Content> {
    Content::builder()
        .data(data)
        .charset(CHARSET)
        .build()
        .map_err(|e| PipelineError::Mail(format!("invalid email content: {e}")))
}

fn destination(message: &EmailMessage) -> Destination {
    Destination::builder().to_addresses(&message.to).build()
}

#[async_trait]
impl Mailer for SesMailer {
    #[instrument(skip(self, message), fields(to = %message.to))]
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let output = self
            .client
            .send_email()
            .from_email_address(&message.from)
            .destination(destination(message))
            .content(email_content(message)?)
            .send()
            .await
            .map_err(|e| PipelineError::Mail(format!("send to {}: {e}", message.to)))?;

        debug!(message_id = ?output.message_id(), "Email accepted by SES");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> EmailMessage {
        EmailMessage {
            from: "noreply@photos.example.com".to_string(),
            to: "owner@example.com".to_string(),
            subject: "Photo x.jpg was reviewed".to_string(),
            body: "Status: Pass\nReason: sharp".to_string(),
        }
    }

    #[test]
    fn test_email_content_is_plain_text() {
        let content = email_content(&message()).unwrap();

        assert!(content.template().is_none());
        assert!(content.raw().is_none());

        let simple = content.simple().unwrap();
        let subject = simple.subject().unwrap();
        assert_eq!(subject.data(), "Photo x.jpg was reviewed");
        assert_eq!(subject.charset(), Some(CHARSET));

        let body = simple.body().unwrap();
        assert!(body.html().is_none());
        assert_eq!(body.text().unwrap().data(), "Status: Pass\nReason: sharp");
    }

    #[test]
    fn test_destination_has_single_recipient() {
        let destination = destination(&message());

        assert_eq!(destination.to_addresses(), ["owner@example.com".to_string()]);
        assert!(destination.cc_addresses().is_empty());
        assert!(destination.bcc_addresses().is_empty());
    }
}

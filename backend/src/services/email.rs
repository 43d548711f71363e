use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};

use super::{CollaboratorError, CollaboratorResult, DeliveryReceipt, MessageSender, OutboundMessage};
use crate::config::SmtpConfig;
use crate::workflows::steps::MessageChannel;

const SERVICE: &str = "smtp";

/// Email delivery over SMTP
#[derive(Debug, Clone)]
pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl SmtpSender {
    pub fn new(smtp_config: &SmtpConfig) -> Self {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Self {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        }
    }

    fn build_message(&self, message: &OutboundMessage) -> CollaboratorResult<Message> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| CollaboratorError::rejected(SERVICE, format!("invalid sender: {}", e)))?;
        let to = message
            .to
            .parse::<Mailbox>()
            .map_err(|e| CollaboratorError::rejected(SERVICE, format!("invalid recipient '{}': {}", message.to, e)))?;

        // Provider templates are not rendered here; the id and variables travel as the body.
        let html_body = match (&message.body, &message.template_id) {
            (Some(body), _) => body.clone(),
            (None, Some(template_id)) => render_template_reference(template_id, &message.variables),
            (None, None) => return Err(CollaboratorError::rejected(SERVICE, "message has no content")),
        };
        let text_body = strip_tags(&html_body);

        Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone().unwrap_or_default())
            .multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_PLAIN).body(text_body))
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_HTML).body(html_body)),
            )
            .map_err(|e| CollaboratorError::rejected(SERVICE, e.to_string()))
    }
}

#[async_trait]
impl MessageSender for SmtpSender {
    async fn send(&self, message: &OutboundMessage) -> CollaboratorResult<DeliveryReceipt> {
        if message.channel != MessageChannel::Email {
            return Err(CollaboratorError::rejected(
                SERVICE,
                format!("cannot deliver {} messages", message.channel.as_str()),
            ));
        }

        let email = self.build_message(message)?;
        let message_id = email
            .headers()
            .get_raw("Message-ID")
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        match self.transport.send(email).await {
            Ok(_) => {
                info!(lead_id = %message.lead_id, "Email sent successfully to {}", message.to);
                Ok(DeliveryReceipt { provider_message_id: message_id })
            }
            Err(e) => {
                error!(lead_id = %message.lead_id, "Failed to send email to {}: {}", message.to, e);
                if e.is_permanent() {
                    Err(CollaboratorError::rejected(SERVICE, e.to_string()))
                } else {
                    Err(CollaboratorError::unavailable(SERVICE, e.to_string()))
                }
            }
        }
    }
}

fn render_template_reference(template_id: &str, variables: &std::collections::BTreeMap<String, String>) -> String {
    let mut body = format!("<p>template: {}</p>", template_id);
    for (key, value) in variables {
        body.push_str(&format!("<p>{}: {}</p>", key, value));
    }
    body
}

/// Plain-text alternative for an HTML body
fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.trim().to_string()
}

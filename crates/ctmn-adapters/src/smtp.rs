//! Relay-based SMTP delivery through lettre's async tokio transport.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::{MailRouting, Mailer, OutgoingEmail, Sender};

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    routing: MailRouting,
}

impl SmtpMailer {
    /// Plain relay to an internal mail server (no TLS, no credentials).
    pub fn relay(host: &str, port: u16, routing: MailRouting) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .build();
        Self { transport, routing }
    }

    pub fn routing(&self) -> &MailRouting {
        &self.routing
    }
}

fn mailbox(sender: &Sender) -> Result<Mailbox> {
    let address: Address = sender
        .address
        .parse()
        .with_context(|| format!("invalid sender address {:?}", sender.address))?;
    Ok(Mailbox::new(Some(sender.name.clone()), address))
}

pub fn build_message(email: &OutgoingEmail, recipients: &[String], bcc: &[String]) -> Result<Message> {
    let mut builder = Message::builder()
        .from(mailbox(&email.from)?)
        .subject(email.subject.clone());
    for to in recipients {
        let to: Mailbox = to
            .parse()
            .with_context(|| format!("invalid recipient address {to:?}"))?;
        builder = builder.to(to);
    }
    for copy in bcc {
        let copy: Mailbox = copy
            .parse()
            .with_context(|| format!("invalid bcc address {copy:?}"))?;
        builder = builder.bcc(copy);
    }

    let html = SinglePart::html(email.html_body.clone());
    let message = match &email.attachment {
        Some(attachment) => {
            let content_type = ContentType::parse(&attachment.content_type)
                .map_err(|e| anyhow!("invalid attachment content type {:?}: {e}", attachment.content_type))?;
            let part = Attachment::new(attachment.filename.clone())
                .body(attachment.bytes.clone(), content_type);
            builder.multipart(MultiPart::mixed().singlepart(html).singlepart(part))
        }
        None => builder.singlepart(html),
    };
    message.context("building email message")
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        let recipients = self.routing.resolve(&email.to)?;
        let message = build_message(email, &recipients, &self.routing.bcc)?;
        self.transport
            .send(message)
            .await
            .with_context(|| format!("sending {:?} via SMTP", email.subject))?;
        info!(to = %recipients.join(", "), subject = %email.subject, "email sent");
        Ok(())
    }
}

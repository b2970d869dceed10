// src/notify/email.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message, MultiPart, SinglePart};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::{DeliverySink, Document};
use crate::config::SmtpSecurity;

pub struct SmtpServer<'a> {
    pub host: &'a str,
    pub port: u16,
    pub security: SmtpSecurity,
}

pub struct EmailSink {
    name: String,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailSink {
    /// Credentials must already be resolved.
    pub fn new(
        name: impl Into<String>,
        server: SmtpServer<'_>,
        user: String,
        pass: String,
        from: &str,
        to: &[String],
    ) -> Result<Self> {
        let host = server.host;
        let builder = match server.security {
            SmtpSecurity::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host),
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host),
        }
        .with_context(|| format!("invalid SMTP host {host:?}"))?;
        let mailer = builder
            .port(server.port)
            .credentials(Credentials::new(user, pass))
            .build();
        let from = from
            .parse()
            .with_context(|| format!("invalid sender address {from:?}"))?;
        let to = to
            .iter()
            .map(|a| a.parse().with_context(|| format!("invalid recipient {a:?}")))
            .collect::<Result<Vec<Mailbox>>>()?;
        if to.is_empty() {
            anyhow::bail!("email sink needs at least one recipient");
        }
        Ok(Self {
            name: name.into(),
            mailer,
            from,
            to,
        })
    }

    fn message(&self, doc: &Document) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(doc.subject.clone());
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_PLAIN)
                            .body(doc.text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_HTML)
                            .body(doc.html.clone()),
                    ),
            )
            .context("build email")
    }
}

#[async_trait]
impl DeliverySink for EmailSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, doc: &Document) -> Result<()> {
        let msg = self.message(doc)?;
        self.mailer.send(msg).await.context("send email")?;
        Ok(())
    }
}

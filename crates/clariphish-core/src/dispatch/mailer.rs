//! Outbound delivery through a campaign's SMTP profile

use async_trait::async_trait;
use clariphish_common::{Error, Result};
use clariphish_storage::models::SmtpProfile;
use lettre::{
    message::{Mailbox, MultiPart, SinglePart},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::debug;

const DEFAULT_SMTP_PORT: u16 = 25;
const SUBMISSIONS_PORT: u16 = 465;
const SUBMISSION_PORT: u16 = 587;

/// A rendered campaign email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to_name: Option<String>,
    pub to_address: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// Delivers one email through the given relay
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, profile: &SmtpProfile, email: &OutgoingEmail) -> Result<()>;
}

/// `lettre` based relay client
pub struct SmtpMailer {
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn transport(&self, profile: &SmtpProfile) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let (host, port) = split_host(&profile.host)?;

        let params = TlsParameters::builder(host.to_string())
            .dangerous_accept_invalid_certs(profile.ignore_cert_errors)
            .build()
            .map_err(|e| Error::Smtp(format!("TLS setup failed: {}", e)))?;

        // Implicit TLS on 465, mandatory STARTTLS on 587, opportunistic elsewhere
        let tls = match port {
            SUBMISSIONS_PORT => Tls::Wrapper(params),
            SUBMISSION_PORT => Tls::Required(params),
            _ => Tls::Opportunistic(params),
        };

        let mut transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .tls(tls)
            .timeout(Some(self.timeout));

        if let Some(username) = profile.username.as_deref().filter(|u| !u.is_empty()) {
            let password = profile.password.clone().unwrap_or_default();
            transport = transport.credentials(Credentials::new(username.to_string(), password));
        }

        Ok(transport.build())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, profile: &SmtpProfile, email: &OutgoingEmail) -> Result<()> {
        let message = build_message(profile, email)?;
        let transport = self.transport(profile)?;

        transport
            .send(message)
            .await
            .map_err(|e| Error::Smtp(e.to_string()))?;
        debug!(relay = %profile.host, "Relay accepted message");
        Ok(())
    }
}

fn build_message(profile: &SmtpProfile, email: &OutgoingEmail) -> Result<Message> {
    let from: Mailbox = profile
        .from_address
        .parse()
        .map_err(|e| Error::Smtp(format!("Invalid from address: {}", e)))?;
    let address: Address = email
        .to_address
        .parse()
        .map_err(|e| Error::Smtp(format!("Invalid recipient address: {}", e)))?;
    let to = Mailbox::new(email.to_name.clone(), address);

    Message::builder()
        .from(from)
        .to(to)
        .subject(email.subject.clone())
        .multipart(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(email.text_body.clone()))
                .singlepart(SinglePart::html(email.html_body.clone())),
        )
        .map_err(|e| Error::Smtp(format!("Failed to build email: {}", e)))
}

/// Split `host:port`, defaulting to port 25
fn split_host(host: &str) -> Result<(&str, u16)> {
    match host.rsplit_once(':') {
        Some((name, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::Smtp(format!("Invalid relay port in {}", host)))?;
            Ok((name, port))
        }
        None => Ok((host, DEFAULT_SMTP_PORT)),
    }
}

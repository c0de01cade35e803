//! Delivery of the consolidated report.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::info;

use super::Report;
use crate::config::SmtpConfig;

/// Sink for the end-of-run report. Implementations own their delivery and
/// retry behavior. Called from a blocking thread.
pub trait Notifier: Send + Sync {
    fn send(&self, report: &Report) -> anyhow::Result<()>;
}

/// Prints the report on stdout.
#[derive(Debug, Default)]
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn send(&self, report: &Report) -> anyhow::Result<()> {
        println!("{}\n\n{}", report.subject, report.body);
        Ok(())
    }
}

/// Mails the report over an implicit-TLS SMTP submission session.
#[derive(Debug, Clone)]
pub struct SmtpNotifier {
    server: String,
    port: u16,
    user: String,
    password: String,
    from: String,
    to: String,
}

impl SmtpNotifier {
    pub fn from_config(smtp: &SmtpConfig) -> Self {
        Self {
            server: smtp.smtpserver.clone(),
            port: smtp.smtpport,
            user: smtp.smtpuser.clone(),
            password: smtp.smtppassword.clone(),
            from: smtp.smtpfrom.clone(),
            to: smtp.smtpto.clone(),
        }
    }

    fn build_message(&self, report: &Report) -> anyhow::Result<Message> {
        let message = Message::builder()
            .from(self.from.parse()?)
            .to(self.to.parse()?)
            .subject(report.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(report.body.clone())?;
        Ok(message)
    }
}

impl Notifier for SmtpNotifier {
    fn send(&self, report: &Report) -> anyhow::Result<()> {
        let message = self.build_message(report)?;

        let mailer = SmtpTransport::relay(&self.server)?
            .port(self.port)
            .credentials(Credentials::new(self.user.clone(), self.password.clone()))
            .build();

        mailer.send(&message)?;
        info!(server = %self.server, to = %self.to, "Report mailed");
        Ok(())
    }
}

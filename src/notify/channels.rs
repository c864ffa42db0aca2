//! Concrete delivery transports.
//!
//! - Signal through a local `signal-cli` install
//! - Email over SMTP (STARTTLS)
//! - SMS through an HTTP gateway taking a JSON POST

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::render::RenderedMessage;
use super::NotificationChannel;
use crate::config::{ChannelKind, Config};

// ── Signal ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub cli_path: String,
    pub account: String,
    pub recipients: Vec<String>,
    /// Longest a single `signal-cli` run may take before it is killed.
    pub timeout: Duration,
}

pub struct SignalChannel {
    config: SignalConfig,
    priority: u32,
    cli_present: OnceCell<bool>,
}

impl SignalChannel {
    pub fn new(config: SignalConfig, priority: u32) -> Self {
        SignalChannel {
            config,
            priority,
            cli_present: OnceCell::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for SignalChannel {
    fn name(&self) -> &str {
        "signal"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn is_available(&self) -> bool {
        if self.config.account.is_empty() || self.config.recipients.is_empty() {
            return false;
        }
        *self
            .cli_present
            .get_or_init(|| async {
                let mut version = Command::new(&self.config.cli_path);
                version.arg("--version").kill_on_drop(true);
                match tokio::time::timeout(self.config.timeout, version.output()).await {
                    Ok(Ok(out)) if out.status.success() => true,
                    Ok(Ok(out)) => {
                        warn!(status = %out.status, "signal-cli present but not working");
                        false
                    }
                    Ok(Err(e)) => {
                        warn!(path = %self.config.cli_path, "signal-cli not found: {}", e);
                        false
                    }
                    Err(_) => {
                        warn!(path = %self.config.cli_path, "signal-cli --version timed out");
                        false
                    }
                }
            })
            .await
    }

    async fn send(&self, message: &RenderedMessage) -> Result<()> {
        let mut command = Command::new(&self.config.cli_path);
        command
            .arg("-a")
            .arg(&self.config.account)
            .arg("send")
            .arg("-m")
            .arg(message.text())
            .args(&self.config.recipients)
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.config.timeout, command.output())
            .await
            .with_context(|| format!("signal-cli did not finish within {:?}", self.config.timeout))?
            .context("Failed to run signal-cli")?;
        if !output.status.success() {
            bail!(
                "signal-cli exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(recipients = self.config.recipients.len(), "Signal message sent");
        Ok(())
    }
}

// ── Email ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

pub struct EmailChannel {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    priority: u32,
}

impl EmailChannel {
    pub fn new(config: EmailConfig, priority: u32) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .with_context(|| format!("Invalid sender address {}", config.from))?;
        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .with_context(|| format!("Invalid recipient address {}", addr))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .with_context(|| format!("Invalid SMTP relay {}", config.smtp_host))?
            .port(config.smtp_port);
        if let (Some(user), Some(pass)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(EmailChannel {
            mailer: builder.build(),
            from,
            to,
            priority,
        })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn is_available(&self) -> bool {
        !self.to.is_empty()
    }

    async fn send(&self, message: &RenderedMessage) -> Result<()> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        let email = builder
            .body(message.body.clone())
            .context("Failed to build email")?;
        self.mailer.send(email).await.context("SMTP send failed")?;
        debug!(recipients = self.to.len(), "Email sent");
        Ok(())
    }
}

// ── SMS gateway ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub recipients: Vec<String>,
}

#[derive(Serialize)]
struct SmsPayload<'a> {
    to: &'a [String],
    message: String,
}

pub struct SmsChannel {
    http: reqwest::Client,
    config: SmsConfig,
    priority: u32,
}

impl SmsChannel {
    pub fn new(config: SmsConfig, priority: u32) -> Result<Self> {
        url::Url::parse(&config.gateway_url)
            .with_context(|| format!("Invalid SMS gateway URL {}", config.gateway_url))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(SmsChannel {
            http,
            config,
            priority,
        })
    }
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn name(&self) -> &str {
        "sms"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn is_available(&self) -> bool {
        !self.config.recipients.is_empty()
    }

    async fn send(&self, message: &RenderedMessage) -> Result<()> {
        let payload = SmsPayload {
            to: &self.config.recipients,
            message: message.text(),
        };
        let mut request = self.http.post(&self.config.gateway_url).json(&payload);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await.context("SMS gateway unreachable")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("SMS gateway returned {}: {}", status, body);
        }
        Ok(())
    }
}

/// Build the configured transports, in priority order. Transports listed in
/// the priority but missing their settings are left out with a warning.
pub fn build_channels(config: &Config) -> Result<Vec<Arc<dyn NotificationChannel>>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    for (rank, kind) in config.channel_priority.iter().enumerate() {
        let priority = rank as u32;
        match kind {
            ChannelKind::Signal => match config.signal_config() {
                Some(c) => channels.push(Arc::new(SignalChannel::new(c, priority))),
                None => warn!("Signal listed in channel priority but not configured"),
            },
            ChannelKind::Email => match config.email_config() {
                Some(c) => channels.push(Arc::new(EmailChannel::new(c, priority)?)),
                None => warn!("Email listed in channel priority but not configured"),
            },
            ChannelKind::Sms => match config.sms_config() {
                Some(c) => channels.push(Arc::new(SmsChannel::new(c, priority)?)),
                None => warn!("SMS listed in channel priority but not configured"),
            },
        }
    }
    Ok(channels)
}

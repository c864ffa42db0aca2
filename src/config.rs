use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::models::Team;
use crate::live_scores::{BreakerPolicy, RetryPolicy};
use crate::monitor::{DetectorConfig, SchedulerSettings};
use crate::notify::channels::{EmailConfig, SignalConfig, SmsConfig};
use crate::notify::DispatchPolicy;

/// Upper bounds for durations taken from the command line.
const MAX_SECS: u64 = 86_400;
const MAX_MINUTES: i64 = 24 * 60;
const MAX_DAYS: i64 = 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ChannelKind {
    Email,
    Sms,
    Signal,
}

/// Football match notifier
#[derive(Parser, Debug, Clone)]
#[command(name = "matchday-notifier", version, about)]
pub struct Config {
    /// JSON file listing the teams to follow
    #[arg(long, env = "TEAMS_FILE", default_value = "teams.json")]
    pub teams_file: PathBuf,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "matchday.db")]
    pub database_path: String,

    // ── Provider ────────────────────────────────────────────────────────────
    /// API-Football key (RapidAPI)
    #[arg(long, env = "API_FOOTBALL_KEY")]
    pub api_key: Option<String>,

    #[arg(
        long,
        env = "API_FOOTBALL_URL",
        default_value = "https://api-football-v1.p.rapidapi.com/v3"
    )]
    pub api_base_url: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Requests allowed per UTC day
    #[arg(long, env = "DAILY_QUOTA", default_value = "100")]
    pub daily_quota: u32,

    /// Dotted path to the penalty-shootout score in a fixture payload
    #[arg(long, env = "SHOOTOUT_PATH", default_value = "score.penalty")]
    pub shootout_path: String,

    // ── Polling ─────────────────────────────────────────────────────────────
    /// Poll interval for matches around kickoff or in play (seconds)
    #[arg(long, env = "FREQUENCY_DURING_MATCH", default_value = "60")]
    pub frequency_during_match: u64,

    /// Poll interval for upcoming matches, also the discovery interval (seconds)
    #[arg(long, env = "FREQUENCY_NORMAL", default_value = "300")]
    pub frequency_normal: u64,

    /// Scheduler tick in seconds
    #[arg(long, env = "TICK_INTERVAL_SECS", default_value = "5")]
    pub tick_interval_secs: u64,

    /// Minutes before kickoff at which polling switches to match cadence
    #[arg(long, env = "KICKOFF_LEAD_MINUTES", default_value = "5")]
    pub kickoff_lead_minutes: i64,

    /// Days ahead to look for fixtures
    #[arg(long, env = "MATCH_DISCOVERY_DAYS", default_value = "3")]
    pub discovery_days: u32,

    /// Days after kickoff a match is kept before being purged
    #[arg(long, env = "MATCH_HISTORY_DAYS", default_value = "7")]
    pub retention_days: i64,

    /// Expected length of a match, stoppages and break included (minutes)
    #[arg(long, env = "EXPECTED_MATCH_MINUTES", default_value = "105")]
    pub expected_match_minutes: i64,

    /// Silence tolerated past the expected end before closing a match (minutes)
    #[arg(long, env = "END_GRACE_MINUTES", default_value = "30")]
    pub end_grace_minutes: i64,

    /// How long shutdown waits for in-flight deliveries (seconds)
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "30")]
    pub shutdown_grace_secs: u64,

    // ── Retry / circuit breaker ─────────────────────────────────────────────
    #[arg(long, env = "MAX_RETRIES", default_value = "5")]
    pub max_retries: u32,

    #[arg(long, env = "INITIAL_BACKOFF_MS", default_value = "1000")]
    pub initial_backoff_ms: u64,

    #[arg(long, env = "MAX_BACKOFF_SECS", default_value = "60")]
    pub max_backoff_secs: u64,

    #[arg(long, env = "BACKOFF_FACTOR", default_value = "2.0")]
    pub backoff_factor: f64,

    /// Relative jitter applied to every backoff delay (0.2 = ±20%)
    #[arg(long, env = "BACKOFF_JITTER", default_value = "0.2")]
    pub backoff_jitter: f64,

    /// Consecutive failures that open a circuit
    #[arg(long, env = "BREAKER_THRESHOLD", default_value = "5")]
    pub breaker_threshold: u32,

    /// Circuit cooldown in seconds (defaults to the backoff cap)
    #[arg(long, env = "BREAKER_COOLDOWN_SECS")]
    pub breaker_cooldown_secs: Option<u64>,

    /// Longest cooldown after repeated failed trials (defaults to 16× cooldown)
    #[arg(long, env = "BREAKER_MAX_COOLDOWN_SECS")]
    pub breaker_max_cooldown_secs: Option<u64>,

    // ── Notifications ───────────────────────────────────────────────────────
    /// Channels in the order they are tried
    #[arg(
        long,
        env = "CHANNEL_PRIORITY",
        value_enum,
        value_delimiter = ',',
        default_value = "email,sms,signal"
    )]
    pub channel_priority: Vec<ChannelKind>,

    /// Send attempts per channel before falling back to the next one
    #[arg(long, env = "DELIVERY_ATTEMPTS", default_value = "3")]
    pub delivery_attempts: u32,

    #[arg(long, env = "DELIVERY_RETRY_DELAY_SECS", default_value = "2")]
    pub delivery_retry_delay_secs: u64,

    #[arg(long, env = "SIGNAL_CLI_PATH", default_value = "signal-cli")]
    pub signal_cli_path: String,

    /// Longest a single signal-cli run may take (seconds)
    #[arg(long, env = "SIGNAL_TIMEOUT_SECS", default_value = "30")]
    pub signal_timeout_secs: u64,

    /// Registered Signal account the messages are sent from
    #[arg(long, env = "SIGNAL_ACCOUNT")]
    pub signal_account: Option<String>,

    #[arg(long, env = "SIGNAL_RECIPIENTS", value_delimiter = ',')]
    pub signal_recipients: Vec<String>,

    #[arg(long, env = "SMTP_HOST")]
    pub smtp_host: Option<String>,

    #[arg(long, env = "SMTP_PORT", default_value = "587")]
    pub smtp_port: u16,

    #[arg(long, env = "SMTP_USERNAME")]
    pub smtp_username: Option<String>,

    #[arg(long, env = "SMTP_PASSWORD")]
    pub smtp_password: Option<String>,

    #[arg(long, env = "EMAIL_FROM")]
    pub email_from: Option<String>,

    #[arg(long, env = "EMAIL_TO", value_delimiter = ',')]
    pub email_to: Vec<String>,

    /// HTTP endpoint accepting `{"to": [...], "message": "..."}`
    #[arg(long, env = "SMS_GATEWAY_URL")]
    pub sms_gateway_url: Option<String>,

    #[arg(long, env = "SMS_API_KEY")]
    pub sms_api_key: Option<String>,

    #[arg(long, env = "SMS_RECIPIENTS", value_delimiter = ',')]
    pub sms_recipients: Vec<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("API_FOOTBALL_KEY is required");
        }
        if self.frequency_during_match == 0 || self.frequency_normal == 0 || self.tick_interval_secs == 0 {
            anyhow::bail!("polling intervals must be positive");
        }
        if self.discovery_days == 0 {
            anyhow::bail!("discovery_days must be at least 1");
        }
        if self.retention_days <= 0 || self.expected_match_minutes <= 0 || self.end_grace_minutes <= 0 {
            anyhow::bail!("retention and match duration settings must be positive");
        }
        if self.kickoff_lead_minutes < 0 {
            anyhow::bail!("kickoff_lead_minutes must not be negative");
        }
        let secs = [
            ("request_timeout_secs", Some(self.request_timeout_secs)),
            ("frequency_during_match", Some(self.frequency_during_match)),
            ("frequency_normal", Some(self.frequency_normal)),
            ("tick_interval_secs", Some(self.tick_interval_secs)),
            ("max_backoff_secs", Some(self.max_backoff_secs)),
            ("breaker_cooldown_secs", self.breaker_cooldown_secs),
            ("breaker_max_cooldown_secs", self.breaker_max_cooldown_secs),
            ("delivery_retry_delay_secs", Some(self.delivery_retry_delay_secs)),
            ("shutdown_grace_secs", Some(self.shutdown_grace_secs)),
            ("signal_timeout_secs", Some(self.signal_timeout_secs)),
        ];
        for (name, value) in secs {
            if value.map_or(false, |v| v > MAX_SECS) {
                anyhow::bail!("{} must be at most {} seconds", name, MAX_SECS);
            }
        }
        if self.initial_backoff_ms > MAX_SECS * 1000 {
            anyhow::bail!("initial_backoff_ms must be at most {} ms", MAX_SECS * 1000);
        }
        let minutes = [
            self.kickoff_lead_minutes,
            self.expected_match_minutes,
            self.end_grace_minutes,
        ];
        if minutes.iter().any(|&m| m > MAX_MINUTES) {
            anyhow::bail!("minute settings must be at most {}", MAX_MINUTES);
        }
        if self.retention_days > MAX_DAYS || i64::from(self.discovery_days) > MAX_DAYS {
            anyhow::bail!("day settings must be at most {}", MAX_DAYS);
        }
        if self.backoff_factor < 1.0 {
            anyhow::bail!("backoff_factor must be at least 1.0");
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            anyhow::bail!("backoff_jitter must be in [0.0, 1.0)");
        }
        if self.initial_backoff_ms == 0 || self.max_backoff_secs == 0 {
            anyhow::bail!("backoff delays must be positive");
        }
        if self.breaker_threshold == 0 {
            anyhow::bail!("breaker_threshold must be at least 1");
        }
        if self.daily_quota == 0 {
            anyhow::bail!("daily_quota must be positive");
        }
        if self.signal_timeout_secs == 0 {
            anyhow::bail!("signal_timeout_secs must be positive");
        }
        if self.delivery_attempts == 0 {
            anyhow::bail!("delivery_attempts must be at least 1");
        }
        if self.channel_priority.is_empty() {
            anyhow::bail!("channel_priority must list at least one channel");
        }
        let unique: HashSet<_> = self.channel_priority.iter().collect();
        if unique.len() != self.channel_priority.len() {
            anyhow::bail!("channel_priority lists a channel more than once");
        }
        Ok(())
    }

    pub fn load_teams(&self) -> Result<Vec<Team>> {
        let raw = std::fs::read_to_string(&self.teams_file)
            .with_context(|| format!("Failed to read teams file {}", self.teams_file.display()))?;
        parse_teams(&raw)
            .with_context(|| format!("Invalid teams file {}", self.teams_file.display()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_secs(self.max_backoff_secs),
            backoff_factor: self.backoff_factor,
            jitter: self.backoff_jitter,
        }
    }

    pub fn breaker_policy(&self) -> BreakerPolicy {
        let cooldown = self.breaker_cooldown_secs.unwrap_or(self.max_backoff_secs);
        let max_cooldown = self
            .breaker_max_cooldown_secs
            .unwrap_or(cooldown.saturating_mul(16))
            .max(cooldown);
        BreakerPolicy {
            failure_threshold: self.breaker_threshold,
            cooldown: chrono::Duration::seconds(cooldown as i64),
            max_cooldown: chrono::Duration::seconds(max_cooldown as i64),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            frequency_normal: chrono::Duration::seconds(self.frequency_normal as i64),
            frequency_during_match: chrono::Duration::seconds(self.frequency_during_match as i64),
            kickoff_lead: chrono::Duration::minutes(self.kickoff_lead_minutes),
            discovery_days: self.discovery_days,
            retention: chrono::Duration::days(self.retention_days),
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            discovery_interval: Duration::from_secs(self.frequency_normal),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            expected_duration: chrono::Duration::minutes(self.expected_match_minutes),
            grace: chrono::Duration::minutes(self.end_grace_minutes),
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            attempts_per_channel: self.delivery_attempts,
            retry_delay: Duration::from_secs(self.delivery_retry_delay_secs),
        }
    }

    pub fn signal_config(&self) -> Option<SignalConfig> {
        let account = self.signal_account.clone()?;
        Some(SignalConfig {
            cli_path: self.signal_cli_path.clone(),
            account,
            recipients: self.signal_recipients.clone(),
            timeout: Duration::from_secs(self.signal_timeout_secs),
        })
    }

    pub fn email_config(&self) -> Option<EmailConfig> {
        Some(EmailConfig {
            smtp_host: self.smtp_host.clone()?,
            smtp_port: self.smtp_port,
            username: self.smtp_username.clone(),
            password: self.smtp_password.clone(),
            from: self.email_from.clone()?,
            to: self.email_to.clone(),
        })
    }

    pub fn sms_config(&self) -> Option<SmsConfig> {
        Some(SmsConfig {
            gateway_url: self.sms_gateway_url.clone()?,
            api_key: self.sms_api_key.clone(),
            recipients: self.sms_recipients.clone(),
        })
    }
}

/// Team ids are numeric for API-Football but may be written as strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TeamId {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct TeamEntry {
    team_id: TeamId,
    name: String,
    #[serde(default)]
    short_name: Option<String>,
    #[serde(default)]
    league: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

fn parse_teams(raw: &str) -> Result<Vec<Team>> {
    let entries: Vec<TeamEntry> = serde_json::from_str(raw)?;
    if entries.is_empty() {
        anyhow::bail!("no teams configured");
    }
    let mut seen = HashSet::new();
    let mut teams = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = match entry.team_id {
            TeamId::Number(n) => n.to_string(),
            TeamId::Text(s) => s.trim().to_string(),
        };
        if id.is_empty() {
            anyhow::bail!("team '{}' has an empty team_id", entry.name);
        }
        if !seen.insert(id.clone()) {
            anyhow::bail!("team_id {} is listed twice", id);
        }
        teams.push(Team {
            id,
            name: entry.name,
            short_name: entry.short_name,
            league: entry.league,
            country: entry.country,
        });
    }
    Ok(teams)
}

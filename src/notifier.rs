// Notices about newly available nights, and where they get delivered
use anyhow::{bail, Context, Result};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{EmailConfig, GithubConfig, NotifyConfig};
use crate::types::CalendarDate;

const NOTICE_TITLE: &str = "🏔️ New Rifugio Availability!";
const CHANGE_TITLE: &str = "🏔️ Rifugio availability calendar updated";
const ERROR_TITLE: &str = "⚠️ Rifugio availability check failed";
const USER_AGENT: &str = concat!("rifugio-monitor/", env!("CARGO_PKG_VERSION"));

/// Everything a notification says about one run.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityNotice {
    pub new_dates: Vec<CalendarDate>,
    pub all_available: Vec<CalendarDate>,
    /// Dates no method could read; listed so they are never silently dropped.
    pub unknown: Vec<CalendarDate>,
    pub source_url: String,
    pub booking_url: Option<String>,
    pub pdf_changed: bool,
}

impl AvailabilityNotice {
    pub fn title(&self) -> &'static str {
        if self.new_dates.is_empty() {
            CHANGE_TITLE
        } else {
            NOTICE_TITLE
        }
    }

    pub fn render_markdown(&self) -> String {
        let mut body = String::new();

        if self.new_dates.is_empty() {
            body.push_str("The availability PDF changed, but no new nights opened up.\n");
        } else {
            let _ = writeln!(body, "## Newly available nights ({})\n", self.new_dates.len());
            for date in &self.new_dates {
                let _ = writeln!(body, "- {} {}", date.status.emoji(), date.describe());
            }
        }

        let _ = writeln!(body, "\n## All available nights ({})\n", self.all_available.len());
        if self.all_available.is_empty() {
            body.push_str("_none_\n");
        }
        for date in &self.all_available {
            let _ = writeln!(body, "- {}", date.describe());
        }

        if !self.unknown.is_empty() {
            let _ = writeln!(
                body,
                "\n## Could not be read ({})\n\nCheck these dates by hand:\n",
                self.unknown.len()
            );
            for date in &self.unknown {
                let _ = writeln!(body, "- {} {}", date.status.emoji(), date.describe());
            }
        }

        let _ = writeln!(body, "\nSource: {}", self.source_url);
        if let Some(booking_url) = &self.booking_url {
            let _ = writeln!(body, "Book at: {}", booking_url);
        }
        if self.pdf_changed {
            body.push_str("\n_The published PDF changed since the last check._\n");
        }
        body
    }

    /// The same content as [`render_markdown`](Self::render_markdown), for mail clients.
    pub fn render_html(&self) -> String {
        let mut html = String::from("<html><body style=\"font-family: Arial, sans-serif; max-width: 600px;\">\n");
        let _ = writeln!(html, "<h2>{}</h2>", escape_html(self.title()));

        if self.new_dates.is_empty() {
            html.push_str("<p>The availability PDF changed, but no new nights opened up.</p>\n");
        } else {
            let _ = writeln!(html, "<h3>Newly available nights ({})</h3>", self.new_dates.len());
            html_list(&mut html, &self.new_dates, true);
        }

        let _ = writeln!(html, "<h3>All available nights ({})</h3>", self.all_available.len());
        if self.all_available.is_empty() {
            html.push_str("<p><em>none</em></p>\n");
        } else {
            html_list(&mut html, &self.all_available, false);
        }

        if !self.unknown.is_empty() {
            let _ = writeln!(html, "<h3>Could not be read ({})</h3>", self.unknown.len());
            html.push_str("<p>Check these dates by hand:</p>\n");
            html_list(&mut html, &self.unknown, true);
        }

        let source = escape_html(&self.source_url);
        let _ = writeln!(html, "<p><a href=\"{}\">📄 View PDF calendar</a></p>", source);
        if let Some(booking_url) = &self.booking_url {
            let _ = writeln!(html, "<p><a href=\"{}\">🏠 Book at the rifugio</a></p>", escape_html(booking_url));
        }
        if self.pdf_changed {
            html.push_str("<p><em>The published PDF changed since the last check.</em></p>\n");
        }
        html.push_str("</body></html>\n");
        html
    }
}

fn html_list(html: &mut String, dates: &[CalendarDate], with_emoji: bool) {
    html.push_str("<ul>\n");
    for date in dates {
        if with_emoji {
            let _ = writeln!(html, "<li>{} {}</li>", date.status.emoji(), escape_html(&date.describe()));
        } else {
            let _ = writeln!(html, "<li>{}</li>", escape_html(&date.describe()));
        }
    }
    html.push_str("</ul>\n");
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// A delivery channel for notices.
#[allow(async_fn_in_trait)]
pub trait Notifier {
    async fn notify(&self, notice: &AvailabilityNotice) -> Result<()>;

    async fn notify_error(&self, message: &str) -> Result<()>;
}

/// Prints notices to stdout.
#[derive(Debug, Clone, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    async fn notify(&self, notice: &AvailabilityNotice) -> Result<()> {
        println!("# {}\n\n{}", notice.title(), notice.render_markdown());
        Ok(())
    }

    async fn notify_error(&self, message: &str) -> Result<()> {
        println!("# {}\n\n{}", ERROR_TITLE, message);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct IssueRequest<'a> {
    title: &'a str,
    body: &'a str,
    labels: &'a [String],
    assignees: &'a [String],
}

/// Opens a GitHub issue per notice.
#[derive(Debug, Clone)]
pub struct GithubIssueNotifier {
    client: Client,
    config: GithubConfig,
    token: String,
}

impl GithubIssueNotifier {
    pub fn new(config: GithubConfig, timeout: Duration) -> Result<Self> {
        let token = config
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .context("GitHub notifications need a token (set GITHUB_TOKEN)")?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, config, token })
    }

    fn issues_url(&self) -> String {
        format!(
            "{}/repos/{}/issues",
            self.config.api_url.trim_end_matches('/'),
            self.config.repository
        )
    }

    async fn open_issue(&self, title: &str, body: &str) -> Result<()> {
        let request = IssueRequest {
            title,
            body,
            labels: &self.config.labels,
            assignees: &self.config.assignees,
        };

        info!(repository = %self.config.repository, title, "opening GitHub issue");
        let response = self
            .client
            .post(self.issues_url())
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .json(&request)
            .send()
            .await
            .context("GitHub request failed")?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            let text = response.text().await.unwrap_or_default();
            bail!("GitHub returned {} creating an issue: {}", status, text.trim());
        }
        Ok(())
    }
}

impl Notifier for GithubIssueNotifier {
    async fn notify(&self, notice: &AvailabilityNotice) -> Result<()> {
        self.open_issue(notice.title(), &notice.render_markdown()).await
    }

    async fn notify_error(&self, message: &str) -> Result<()> {
        let body = format!("The scheduled availability check failed:\n\n```\n{}\n```\n", message);
        self.open_issue(ERROR_TITLE, &body).await
    }
}

/// Sends each notice as a plain text + HTML email over SMTP with STARTTLS.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailNotifier")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

impl EmailNotifier {
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self> {
        let password = config
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .context("Email notifications need a password (set EMAIL_PASSWORD)")?;
        let from: Mailbox = config
            .from
            .parse()
            .with_context(|| format!("invalid sender address '{}'", config.from))?;
        let to = config
            .to
            .iter()
            .map(|address| {
                address
                    .parse::<Mailbox>()
                    .with_context(|| format!("invalid recipient address '{}'", address))
            })
            .collect::<Result<Vec<_>>>()?;
        if to.is_empty() {
            bail!("Email notifications need at least one recipient");
        }

        let username = config.username.clone().unwrap_or_else(|| config.from.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .with_context(|| format!("invalid SMTP host '{}'", config.smtp_host))?
            .port(config.smtp_port)
            .credentials(Credentials::new(username, password))
            .timeout(Some(timeout))
            .build();
        Ok(Self { transport, from, to })
    }

    fn message(&self, subject: &str, text: String, html: String) -> Result<Message> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder
            .multipart(MultiPart::alternative_plain_html(text, html))
            .context("failed to build email")
    }

    async fn send(&self, message: Message) -> Result<()> {
        info!(recipients = self.to.len(), "sending email");
        self.transport.send(message).await.context("SMTP delivery failed")?;
        Ok(())
    }
}

impl Notifier for EmailNotifier {
    async fn notify(&self, notice: &AvailabilityNotice) -> Result<()> {
        let message = self.message(notice.title(), notice.render_markdown(), notice.render_html())?;
        self.send(message).await
    }

    async fn notify_error(&self, message: &str) -> Result<()> {
        let text = format!("The scheduled availability check failed:\n\n{}\n", message);
        let html = format!(
            "<html><body><h2>{}</h2><p>The scheduled availability check failed:</p><pre>{}</pre></body></html>\n",
            escape_html(ERROR_TITLE),
            escape_html(message)
        );
        let email = self.message(ERROR_TITLE, text, html)?;
        self.send(email).await
    }
}

/// One configured delivery channel.
#[derive(Debug)]
pub enum Channel {
    Github(GithubIssueNotifier),
    Email(EmailNotifier),
}

impl Channel {
    fn name(&self) -> &'static str {
        match self {
            Channel::Github(_) => "github",
            Channel::Email(_) => "email",
        }
    }

    async fn notify(&self, notice: &AvailabilityNotice) -> Result<()> {
        match self {
            Channel::Github(n) => n.notify(notice).await,
            Channel::Email(n) => n.notify(notice).await,
        }
    }

    async fn notify_error(&self, message: &str) -> Result<()> {
        match self {
            Channel::Github(n) => n.notify_error(message).await,
            Channel::Email(n) => n.notify_error(message).await,
        }
    }
}

/// Every channel picked from configuration; stdout when none is usable.
#[derive(Debug, Default)]
pub struct AnyNotifier {
    channels: Vec<Channel>,
}

impl AnyNotifier {
    /// GitHub issues when a repository and token are configured, email when
    /// sender, recipients and password are; both when both are.
    pub fn from_config(config: &NotifyConfig, timeout: Duration) -> Result<Self> {
        let mut channels = Vec::new();

        match &config.github {
            Some(github) if github.token.as_deref().is_some_and(|t| !t.is_empty()) => {
                channels.push(Channel::Github(GithubIssueNotifier::new(github.clone(), timeout)?));
            }
            Some(github) => {
                warn!(repository = %github.repository, "no GitHub token, skipping GitHub issues");
            }
            None => {}
        }

        match &config.email {
            Some(email) if email.password.as_deref().is_some_and(|p| !p.is_empty()) => {
                channels.push(Channel::Email(EmailNotifier::new(email, timeout)?));
            }
            Some(email) => warn!(from = %email.from, "no email password, skipping email"),
            None => {}
        }

        if channels.is_empty() {
            info!("no delivery channel configured, printing notices instead");
        }
        Ok(Self { channels })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// True when notices only go to stdout.
    pub fn is_console(&self) -> bool {
        self.channels.is_empty()
    }
}

// Every channel is tried; the run fails if any of them failed
fn all_delivered(failures: Vec<(&'static str, anyhow::Error)>) -> Result<()> {
    let Some((channel, error)) = failures.into_iter().next() else {
        return Ok(());
    };
    Err(error.context(format!("{} delivery failed", channel)))
}

impl Notifier for AnyNotifier {
    async fn notify(&self, notice: &AvailabilityNotice) -> Result<()> {
        if self.is_console() {
            return ConsoleNotifier.notify(notice).await;
        }
        let mut failures = Vec::new();
        for channel in &self.channels {
            if let Err(e) = channel.notify(notice).await {
                warn!(channel = channel.name(), "notification failed: {:#}", e);
                failures.push((channel.name(), e));
            }
        }
        all_delivered(failures)
    }

    async fn notify_error(&self, message: &str) -> Result<()> {
        if self.is_console() {
            return ConsoleNotifier.notify_error(message).await;
        }
        let mut failures = Vec::new();
        for channel in &self.channels {
            if let Err(e) = channel.notify_error(message).await {
                warn!(channel = channel.name(), "error report failed: {:#}", e);
                failures.push((channel.name(), e));
            }
        }
        all_delivered(failures)
    }
}

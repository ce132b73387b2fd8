//! Source client contracts, file-backed source clients and notification transports.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipo_core::{AuthError, Credentials, FetchError, NotifyError, Offering, RawOffering};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ipo-adapters";

/// Authenticated handle on the source portal. Closing is idempotent.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    dp_id: String,
    username: String,
    opened_at: DateTime<Utc>,
    closed: bool,
}

impl Session {
    pub fn open(credentials: &Credentials) -> Self {
        Self {
            id: Uuid::new_v4(),
            dp_id: credentials.dp_id.clone(),
            username: credentials.username.clone(),
            opened_at: Utc::now(),
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dp_id(&self) -> &str {
        &self.dp_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true when this call actually closed the session.
    pub fn mark_closed(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    pub fn ensure_open(&self) -> Result<(), FetchError> {
        if self.closed {
            Err(FetchError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError>;

    async fn list_current_offerings(&self, session: &Session) -> Result<Vec<RawOffering>, FetchError>;

    /// Releases the session. Safe to call repeatedly and after any failure.
    async fn close(&self, session: &mut Session) {
        if session.mark_closed() {
            debug!(source = self.source_id(), session_id = %session.id(), "source session closed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Fixture,
    Html,
}

impl std::str::FromStr for SourceMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixture" | "json" => Ok(SourceMode::Fixture),
            "html" | "asba" => Ok(SourceMode::Html),
            other => Err(anyhow::anyhow!("unknown source mode {other:?} (expected fixture or html)")),
        }
    }
}

pub fn source_client_for_mode(mode: SourceMode, path: impl Into<PathBuf>) -> Box<dyn SourceClient> {
    match mode {
        SourceMode::Fixture => Box::new(FixtureSourceClient::new(path)),
        SourceMode::Html => Box::new(AsbaHtmlSourceClient::new(path)),
    }
}

/// One issue row as exported by the portal scraper. Accepts both the portal's own field
/// names and the snapshot's.
#[derive(Debug, Clone, Deserialize)]
struct FixtureIssue {
    #[serde(alias = "company_name")]
    name: String,
    #[serde(alias = "share_type")]
    kind: String,
    #[serde(alias = "sub_group", alias = "share_group")]
    group: String,
}

async fn read_source_file(path: &Path) -> Result<String, FetchError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| FetchError::Transport(format!("reading {}: {err}", path.display())))
}

/// Serves the JSON array stored at `path`, re-read on every fetch.
#[derive(Debug, Clone)]
pub struct FixtureSourceClient {
    path: PathBuf,
}

impl FixtureSourceClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn parse_fixture_listing(text: &str) -> Result<Vec<RawOffering>, FetchError> {
    let issues: Vec<FixtureIssue> =
        serde_json::from_str(text).map_err(|err| FetchError::Parse(err.to_string()))?;
    Ok(issues
        .into_iter()
        .map(|issue| RawOffering::new(issue.name, issue.kind, issue.group))
        .collect())
}

#[async_trait]
impl SourceClient for FixtureSourceClient {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        credentials.ensure_complete()?;
        Ok(Session::open(credentials))
    }

    async fn list_current_offerings(&self, session: &Session) -> Result<Vec<RawOffering>, FetchError> {
        session.ensure_open()?;
        let text = read_source_file(&self.path).await?;
        let offerings = parse_fixture_listing(&text)?;
        info!(path = %self.path.display(), count = offerings.len(), "loaded fixture listing");
        Ok(offerings)
    }
}

/// Reads a captured "My ASBA" dashboard page and extracts the open issues.
#[derive(Debug, Clone)]
pub struct AsbaHtmlSourceClient {
    path: PathBuf,
}

impl AsbaHtmlSourceClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

const COMPANY_ROW: &str = "div.company-list";
const COMPANY_NAME: &str = "span[tooltip='Company Name']";
const SUB_GROUP: &str = "span[tooltip='Sub Group']";
const SHARE_TYPE: &str = "span.share-of-type";

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|err| FetchError::Parse(format!("selector {css}: {err}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(row: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    row.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Parses the ASBA company list. Rows missing any of the three fields are skipped with
/// a warning; a page without rows yields an empty listing.
pub fn parse_asba_listing(html: &str) -> Result<Vec<RawOffering>, FetchError> {
    let row_sel = selector(COMPANY_ROW)?;
    let name_sel = selector(COMPANY_NAME)?;
    let group_sel = selector(SUB_GROUP)?;
    let kind_sel = selector(SHARE_TYPE)?;

    let document = Html::parse_document(html);
    let mut out = Vec::new();
    for (idx, row) in document.select(&row_sel).enumerate() {
        let name = first_text(&row, &name_sel);
        let group = first_text(&row, &group_sel);
        let kind = first_text(&row, &kind_sel);
        match (name, kind, group) {
            (Some(name), Some(kind), Some(group)) => {
                debug!(item = idx + 1, %name, %group, %kind, "parsed issue");
                out.push(RawOffering { name, kind, group });
            }
            _ => warn!(item = idx + 1, "skipping issue row with missing fields"),
        }
    }
    Ok(out)
}

#[async_trait]
impl SourceClient for AsbaHtmlSourceClient {
    fn source_id(&self) -> &'static str {
        "asba-html"
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        credentials.ensure_complete()?;
        Ok(Session::open(credentials))
    }

    async fn list_current_offerings(&self, session: &Session) -> Result<Vec<RawOffering>, FetchError> {
        session.ensure_open()?;
        let html = read_source_file(&self.path).await?;
        let offerings = parse_asba_listing(&html)?;
        if offerings.is_empty() {
            info!(path = %self.path.display(), "no current issues found");
        } else {
            info!(path = %self.path.display(), count = offerings.len(), "found active issues");
        }
        Ok(offerings)
    }
}

/// In-memory source. Optionally pinned to one set of credentials, anything else is
/// rejected.
#[derive(Debug, Default)]
pub struct StaticSourceClient {
    offerings: Mutex<Vec<RawOffering>>,
    accepted: Option<Credentials>,
}

impl StaticSourceClient {
    pub fn new(offerings: Vec<RawOffering>) -> Self {
        Self {
            offerings: Mutex::new(offerings),
            accepted: None,
        }
    }

    pub fn accepting_only(mut self, credentials: Credentials) -> Self {
        self.accepted = Some(credentials);
        self
    }

    pub async fn replace_offerings(&self, offerings: Vec<RawOffering>) {
        *self.offerings.lock().await = offerings;
    }
}

#[async_trait]
impl SourceClient for StaticSourceClient {
    fn source_id(&self) -> &'static str {
        "static"
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        credentials.ensure_complete()?;
        if let Some(accepted) = &self.accepted {
            if accepted != credentials {
                return Err(AuthError::Rejected(format!(
                    "unknown user {} for dp {}",
                    credentials.username, credentials.dp_id
                )));
            }
        }
        Ok(Session::open(credentials))
    }

    async fn list_current_offerings(&self, session: &Session) -> Result<Vec<RawOffering>, FetchError> {
        session.ensure_open()?;
        Ok(self.offerings.lock().await.clone())
    }
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Announces newly observed offerings. `Ok(true)` means at least one recipient
    /// accepted the message.
    async fn notify(&self, recipients: &[String], offerings: &[Offering]) -> Result<bool, NotifyError>;
}

/// Notification sink that only writes to the log. Used when no email transport is
/// configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationService for LogNotifier {
    async fn notify(&self, recipients: &[String], offerings: &[Offering]) -> Result<bool, NotifyError> {
        for offering in offerings {
            info!(
                company = %offering.name,
                symbol = %offering.group,
                kind = %offering.kind,
                recipients = recipients.len(),
                "new offering (log-only notifier)"
            );
        }
        Ok(!recipients.is_empty())
    }
}

pub const BREVO_EMAIL_ENDPOINT: &str = "https://api.brevo.com/v3/smtp/email";

pub const ALERT_SUBJECT: &str = "IPO Now Open \u{2013} Don\u{2019}t Miss This Investment Opportunity";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub sender_email: String,
    pub sender_name: String,
    pub endpoint: String,
    pub timeout: Duration,
}

impl EmailConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            sender_email: "no-reply@newspluk.com".to_string(),
            sender_name: "Mero-Lagani Team".to_string(),
            endpoint: BREVO_EMAIL_ENDPOINT.to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailAddress {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Transactional email request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub sender: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub subject: String,
    pub html_content: String,
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn build_alert_message(config: &EmailConfig, recipient: &str, offerings: &[Offering]) -> EmailMessage {
    let items = offerings
        .iter()
        .map(|o| {
            format!(
                "<li><strong>{}</strong> ({}) <em>{}</em></li>",
                escape_html(&o.name),
                escape_html(&o.group),
                escape_html(&o.kind)
            )
        })
        .collect::<Vec<_>>()
        .join("");
    let html_content = format!(
        "<p>Dear Investor,</p><p>New issues are open for application:</p><ul>{items}</ul>\
         <p>This email was sent to {}. This is a notification-only address.</p>",
        escape_html(recipient)
    );
    EmailMessage {
        sender: EmailAddress {
            email: config.sender_email.clone(),
            name: Some(config.sender_name.clone()),
        },
        to: vec![EmailAddress {
            email: recipient.to_string(),
            name: None,
        }],
        subject: ALERT_SUBJECT.to_string(),
        html_content,
    }
}

/// Sends one alert per recipient through the Brevo transactional email API.
#[derive(Debug)]
pub struct EmailNotifier {
    client: reqwest::Client,
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building email http client")?;
        Ok(Self { client, config })
    }

    async fn send(&self, message: &EmailMessage) -> Result<(), SendFailure> {
        let resp = self
            .client
            .post(&self.config.endpoint)
            .header("api-key", &self.config.api_key)
            .json(message)
            .send()
            .await
            .map_err(|err| SendFailure::Request(err.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SendFailure::Rejected(status.as_u16()))
        }
    }
}

#[derive(Debug)]
enum SendFailure {
    Request(String),
    Rejected(u16),
}

#[async_trait]
impl NotificationService for EmailNotifier {
    async fn notify(&self, recipients: &[String], offerings: &[Offering]) -> Result<bool, NotifyError> {
        let mut delivered = 0usize;
        let mut last_request_error = None;
        let mut rejected = 0usize;

        for recipient in recipients {
            let message = build_alert_message(&self.config, recipient, offerings);
            match self.send(&message).await {
                Ok(()) => {
                    delivered += 1;
                    info!(%recipient, "alert email sent");
                }
                Err(SendFailure::Rejected(status)) => {
                    rejected += 1;
                    warn!(%recipient, status, "alert email rejected");
                }
                Err(SendFailure::Request(err)) => {
                    warn!(%recipient, error = %err, "alert email failed");
                    last_request_error = Some(err);
                }
            }
        }

        if delivered == 0 && rejected == 0 {
            if let Some(err) = last_request_error {
                return Err(NotifyError::Transport(err));
            }
        }
        Ok(delivered > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::path::Path;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn creds() -> Credentials {
        Credentials::new("13700", "investor", "secret")
    }

    #[tokio::test]
    async fn fixture_client_reads_workspace_fixture() {
        let client = FixtureSourceClient::new(workspace_root().join("fixtures/current_issues.json"));
        let session = client.authenticate(&creds()).await.unwrap();
        let offerings = client.list_current_offerings(&session).await.unwrap();
        assert_eq!(offerings.len(), 3);
        assert_eq!(offerings[0].name, "Alpha Hydropower Limited");
        assert_eq!(offerings[0].group, "Ordinary Shares");
        assert_eq!(offerings[2].kind, "RIGHTS");
    }

    #[tokio::test]
    async fn fixture_client_reports_parse_and_transport_errors() {
        let dir = tempdir().expect("tempdir");
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();

        let client = FixtureSourceClient::new(&bad);
        let session = client.authenticate(&creds()).await.unwrap();
        assert!(matches!(
            client.list_current_offerings(&session).await,
            Err(FetchError::Parse(_))
        ));

        let missing = FixtureSourceClient::new(dir.path().join("missing.json"));
        assert!(matches!(
            missing.list_current_offerings(&session).await,
            Err(FetchError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn authenticate_rejects_incomplete_credentials() {
        let client = FixtureSourceClient::new("unused.json");
        let err = client
            .authenticate(&Credentials::new("13700", "investor", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingCredentials));
    }

    #[tokio::test]
    async fn static_client_pins_credentials_and_close_is_idempotent() {
        let client = StaticSourceClient::new(vec![RawOffering::new("Alpha Hydro", "IPO", "AH")])
            .accepting_only(creds());
        assert!(matches!(
            client
                .authenticate(&Credentials::new("13700", "someone", "else"))
                .await,
            Err(AuthError::Rejected(_))
        ));

        let mut session = client.authenticate(&creds()).await.unwrap();
        assert_eq!(client.list_current_offerings(&session).await.unwrap().len(), 1);

        client.close(&mut session).await;
        client.close(&mut session).await;
        assert!(session.is_closed());
        assert!(matches!(
            client.list_current_offerings(&session).await,
            Err(FetchError::SessionClosed)
        ));
    }

    #[test]
    fn source_mode_parses_aliases() {
        assert_eq!("fixture".parse::<SourceMode>().unwrap(), SourceMode::Fixture);
        assert_eq!("HTML".parse::<SourceMode>().unwrap(), SourceMode::Html);
        assert!("selenium".parse::<SourceMode>().is_err());
    }

    #[test]
    fn alert_message_escapes_and_lists_every_offering() {
        let config = EmailConfig::new("key");
        let offerings = vec![
            Offering {
                name: "Alpha & Sons".into(),
                kind: "IPO".into(),
                group: "AS".into(),
                observed_date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            },
            Offering {
                name: "Beta Finance".into(),
                kind: "FPO".into(),
                group: "BF".into(),
                observed_date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            },
        ];
        let message = build_alert_message(&config, "investor@example.com", &offerings);
        assert_eq!(message.to[0].email, "investor@example.com");
        assert!(message.html_content.contains("Alpha &amp; Sons"));
        assert!(message.html_content.contains("Beta Finance"));

        let body = serde_json::to_value(&message).unwrap();
        assert!(body.get("htmlContent").is_some());
        assert_eq!(body["sender"]["name"], "Mero-Lagani Team");
    }

    #[tokio::test]
    async fn log_notifier_needs_recipients() {
        let notifier = LogNotifier;
        assert!(!notifier.notify(&[], &[]).await.unwrap());
        assert!(notifier.notify(&["a@example.com".into()], &[]).await.unwrap());
    }
}

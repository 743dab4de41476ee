//! Adapters for the two external collaborators of the archive pipeline: the
//! HTTP archiving endpoint and the operator mail relay.

use std::time::Duration;

use async_trait::async_trait;
use dap_core::{ArchiveOutcome, Notification, RecordId};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dap-adapters";

/// Transport or decoding failure of one archive call. The `Display` output is
/// the failure detail reported to the operator.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to decode response: {message}")]
    Decode { status: u16, message: String },
    #[error("invalid archive endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
}

#[async_trait]
pub trait ArchiveClient: Send + Sync {
    async fn archive(&self, id: &RecordId) -> Result<ArchiveOutcome, ArchiveError>;
}

/// Wire shape of the archive endpoint response:
/// `{"success": bool, "result": {"result": string, "file": string}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ArchiveResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<ArchiveResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ArchiveResult {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub file: String,
}

impl From<ArchiveResponse> for ArchiveOutcome {
    fn from(resp: ArchiveResponse) -> Self {
        let result = resp.result.unwrap_or_default();
        if resp.success {
            ArchiveOutcome::archived(result.file)
        } else {
            ArchiveOutcome::failed(format!("archive failed: {}", result.result))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveClientConfig {
    pub archive_url: String,
    pub query_param: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ArchiveClientConfig {
    fn default() -> Self {
        Self {
            archive_url: "http://localhost:8080/archive".to_string(),
            query_param: "deal".to_string(),
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

impl ArchiveClientConfig {
    pub fn validate(&self) -> Result<(), ArchiveError> {
        let invalid = |reason: String| ArchiveError::InvalidEndpoint {
            url: self.archive_url.clone(),
            reason,
        };
        let url = reqwest::Url::parse(&self.archive_url).map_err(|err| invalid(err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        if self.query_param.trim().is_empty() {
            return Err(invalid("query parameter name is empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpArchiveClient {
    client: reqwest::Client,
    archive_url: String,
    query_param: String,
}

impl HttpArchiveClient {
    pub fn new(config: ArchiveClientConfig) -> Result<Self, ArchiveError> {
        config.validate()?;
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            archive_url: config.archive_url,
            query_param: config.query_param,
        })
    }

    async fn request(&self, id: &RecordId) -> Result<ArchiveOutcome, ArchiveError> {
        let resp = self
            .client
            .get(&self.archive_url)
            .query(&[(self.query_param.as_str(), id.as_str())])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "archive endpoint answered with error status");
        }

        serde_json::from_slice::<ArchiveResponse>(&body)
            .map(ArchiveOutcome::from)
            .map_err(|err| ArchiveError::Decode {
                status: status.as_u16(),
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    async fn archive(&self, id: &RecordId) -> Result<ArchiveOutcome, ArchiveError> {
        let span = info_span!("archive_request", record_id = %id, url = %self.archive_url);
        let result = self.request(id).instrument(span).await;
        debug!(record_id = %id, ok = result.is_ok(), "archive call returned");
        result
    }
}

/// Best-effort delivery of operator notifications. Implementations log their
/// own failures; nothing is reported back to the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mailbox {value:?}: {source}")]
    Address {
        value: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("building message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp transport: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
    pub timeout: Duration,
}

pub fn parse_mailbox(value: &str) -> Result<Mailbox, NotifyError> {
    value.parse::<Mailbox>().map_err(|source| NotifyError::Address {
        value: value.to_string(),
        source,
    })
}

/// Plaintext message with `From`, `To` and `Subject` headers.
pub fn build_message(
    from: &Mailbox,
    to: &Mailbox,
    notification: &Notification,
) -> Result<Message, NotifyError> {
    let message = Message::builder()
        .from(from.clone())
        .to(to.clone())
        .subject(notification.subject.clone())
        .header(ContentType::TEXT_PLAIN)
        .body(notification.body.clone())?;
    Ok(message)
}

/// Sends notifications through an authenticated SMTP session. STARTTLS is
/// required before AUTH LOGIN.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let from = parse_mailbox(&config.from)?;
        let to = parse_mailbox(&config.to)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .authentication(vec![Mechanism::Login])
            .timeout(Some(config.timeout))
            .build();
        Ok(Self { transport, from, to })
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = build_message(&self.from, &self.to, notification)?;
        self.transport.send(message).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, notification: &Notification) {
        match self.send(notification).await {
            Ok(()) => info!(subject = %notification.subject, to = %self.to, "notification sent"),
            Err(err) => error!(
                error = %err,
                subject = %notification.subject,
                to = %self.to,
                "notification delivery failed"
            ),
        }
    }
}

/// Writes notifications to the log instead of mailing them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) {
        info!(
            subject = %notification.subject,
            body = %notification.body,
            "notification (mail disabled)"
        );
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) {
        self.sent.lock().await.push(notification.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp_config() -> SmtpConfig {
        SmtpConfig {
            server: "smtp.example.com".into(),
            port: 587,
            username: "bot".into(),
            password: "secret".into(),
            from: "Archive Bot <bot@example.com>".into(),
            to: "ops@example.com".into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn success_response_maps_to_archived_outcome() {
        let resp: ArchiveResponse = serde_json::from_str(
            r#"{"success": true, "result": {"result": "ok", "file": "d1.zip"}}"#,
        )
        .expect("decode");
        assert_eq!(ArchiveOutcome::from(resp), ArchiveOutcome::archived("d1.zip"));
    }

    #[test]
    fn failure_response_carries_result_text() {
        let resp: ArchiveResponse =
            serde_json::from_str(r#"{"success": false, "result": {"result": "deal locked"}}"#)
                .expect("decode");
        let outcome = ArchiveOutcome::from(resp);
        assert!(!outcome.success);
        assert_eq!(outcome.detail, "archive failed: deal locked");
    }

    #[test]
    fn sparse_or_null_result_decodes_as_failure() {
        for body in [r#"{}"#, r#"{"success": false, "result": null}"#] {
            let resp: ArchiveResponse = serde_json::from_str(body).expect("decode");
            let outcome = ArchiveOutcome::from(resp);
            assert!(!outcome.success);
            assert_eq!(outcome.detail, "archive failed: ");
        }
    }

    #[test]
    fn error_display_is_operator_facing_detail() {
        let err = ArchiveError::Decode {
            status: 502,
            message: "expected value at line 1 column 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to decode response: expected value at line 1 column 1"
        );
    }

    #[test]
    fn endpoint_validation_rejects_non_http_urls() {
        let mut config = ArchiveClientConfig::default();
        assert!(config.validate().is_ok());

        config.archive_url = "ftp://archive.example.com/run".into();
        assert!(matches!(
            config.validate(),
            Err(ArchiveError::InvalidEndpoint { reason, .. }) if reason == "unsupported scheme ftp"
        ));

        config.archive_url = "not a url".into();
        assert!(config.validate().is_err());

        config.archive_url = "https://archive.example.com/run".into();
        config.query_param = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn message_has_plaintext_headers_and_body() {
        let from = parse_mailbox("bot@example.com").expect("from");
        let to = parse_mailbox("ops@example.com").expect("to");
        let id = RecordId::from("d2");
        let message = build_message(&from, &to, &Notification::failed(&id, "boom")).expect("message");
        let raw = String::from_utf8(message.formatted()).expect("utf8");

        assert!(raw.contains("From: bot@example.com"));
        assert!(raw.contains("To: ops@example.com"));
        assert!(raw.contains("Subject: Deal Archive Error"));
        assert!(raw.contains("Content-Type: text/plain"));
        assert!(raw.contains("Deal ID: d2"));
        assert!(raw.contains("Error: boom"));
    }

    #[test]
    fn smtp_notifier_rejects_bad_mailboxes() {
        let mut config = smtp_config();
        config.to = "not an address".into();
        match SmtpNotifier::new(&config) {
            Err(NotifyError::Address { value, .. }) => assert_eq!(value, "not an address"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected mailbox error"),
        }
    }

    #[tokio::test]
    async fn smtp_delivery_failure_is_swallowed() {
        let mut config = smtp_config();
        config.server = "127.0.0.1".into();
        config.port = 1;
        config.timeout = Duration::from_millis(500);
        let notifier = SmtpNotifier::new(&config).expect("notifier");
        let id = RecordId::from("d1");

        tokio::time::timeout(
            Duration::from_secs(10),
            notifier.notify(&Notification::archived(&id, "d1.zip")),
        )
        .await
        .expect("notify returns when the relay is unreachable");
    }

    #[tokio::test]
    async fn recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();
        let id = RecordId::from("d1");
        notifier.notify(&Notification::archived(&id, "a.zip")).await;
        notifier.notify(&Notification::failed(&id, "b")).await;
        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].subject, "Deal Archived Successfully");
        assert_eq!(sent[1].subject, "Deal Archive Error");
    }
}

//! Archive pipeline orchestration: configuration, the per-record processor,
//! cycle fan-out and the interval scheduler.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dap_adapters::{
    parse_mailbox, ArchiveClient, ArchiveClientConfig, HttpArchiveClient, LogNotifier, Notifier,
    SmtpConfig, SmtpNotifier,
};
use dap_core::{ArchiveOutcome, ArchiveStatus, Notification, RecordId, StatusValues};
use dap_storage::{MySqlStatusStore, PoolSettings, RecordTable, StatusStore};
use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlConnectOptions;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dap-sync";

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "production")]
    pub database: DatabaseConfig,
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub smtp: MailConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub name: String,
    /// Full connection URL; takes precedence over the discrete fields.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_status_column")]
    pub status_column: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    pub check_interval: u64,
    pub source_status: String,
    pub archiving_status: String,
    pub archived_status: String,
    pub error_status: String,
    pub archive_url: String,
    #[serde(default = "default_query_param")]
    pub query_param: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Upper bound on concurrently processed records; 0 disables the bound.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default = "default_smtp_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server: String::new(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: String::new(),
            to: String::new(),
            timeout_secs: default_smtp_timeout_secs(),
        }
    }
}

fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    3306
}
fn default_table() -> String {
    "vtiger_potential".to_string()
}
fn default_id_column() -> String {
    "potentialid".to_string()
}
fn default_status_column() -> String {
    "archive_status".to_string()
}
fn default_max_connections() -> u32 {
    10
}
fn default_acquire_timeout_secs() -> u64 {
    10
}
fn default_query_param() -> String {
    "deal".to_string()
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_max_concurrency() -> usize {
    16
}
fn default_shutdown_grace_secs() -> u64 {
    120
}
fn default_user_agent() -> String {
    "dap-archiver/0.1".to_string()
}
fn default_true() -> bool {
    true
}
fn default_smtp_port() -> u16 {
    587
}
fn default_smtp_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    /// Reads, applies environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config =
            Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(password) = lookup("DAP_DB_PASSWORD") {
            self.database.password = password;
        }
        if let Some(password) = lookup("DAP_SMTP_PASSWORD") {
            self.smtp.password = password;
        }
        if let Some(url) = lookup("DAP_ARCHIVE_URL") {
            self.archive.archive_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.archive.check_interval == 0 {
            bail!("archive.check_interval must be greater than zero");
        }
        self.status_values()
            .validate()
            .context("validating archive status values")?;
        self.record_table().context("validating record table")?;
        self.archive_client_config()
            .validate()
            .context("validating archive endpoint")?;
        if self.smtp.enabled {
            if self.smtp.server.trim().is_empty() {
                bail!("smtp.server is required when mail is enabled");
            }
            parse_mailbox(&self.smtp.from).context("validating smtp.from")?;
            parse_mailbox(&self.smtp.to).context("validating smtp.to")?;
        }
        Ok(())
    }

    pub fn status_values(&self) -> StatusValues {
        StatusValues {
            pending: self.archive.source_status.clone(),
            archiving: self.archive.archiving_status.clone(),
            archived: self.archive.archived_status.clone(),
            errored: self.archive.error_status.clone(),
        }
    }

    pub fn record_table(&self) -> Result<RecordTable> {
        Ok(RecordTable::new(
            self.database.table.clone(),
            self.database.id_column.clone(),
            self.database.status_column.clone(),
        )?)
    }

    pub fn connect_options(&self) -> Result<MySqlConnectOptions> {
        if let Some(url) = &self.database.url {
            return url
                .parse::<MySqlConnectOptions>()
                .context("parsing database url");
        }
        Ok(MySqlConnectOptions::new()
            .host(&self.database.host)
            .port(self.database.port)
            .username(&self.database.user)
            .password(&self.database.password)
            .database(&self.database.name))
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.database.max_connections,
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_secs),
        }
    }

    pub fn archive_client_config(&self) -> ArchiveClientConfig {
        ArchiveClientConfig {
            archive_url: self.archive.archive_url.clone(),
            query_param: self.archive.query_param.clone(),
            timeout: Duration::from_secs(self.archive.request_timeout_secs),
            user_agent: Some(self.archive.user_agent.clone()),
        }
    }

    pub fn smtp_config(&self) -> SmtpConfig {
        SmtpConfig {
            server: self.smtp.server.clone(),
            port: self.smtp.port,
            username: self.smtp.username.clone(),
            password: self.smtp.password.clone(),
            from: self.smtp.from.clone(),
            to: self.smtp.to.clone(),
            timeout: Duration::from_secs(self.smtp.timeout_secs),
        }
    }

    pub fn limits(&self) -> PipelineLimits {
        PipelineLimits {
            check_interval: Duration::from_secs(self.archive.check_interval),
            max_concurrency: self.archive.max_concurrency,
            shutdown_grace: Duration::from_secs(self.archive.shutdown_grace_secs),
        }
    }

    /// Human-readable summary with secrets masked.
    pub fn redacted_summary(&self) -> String {
        let database = match &self.database.url {
            Some(_) => "url (from DATABASE_URL or config)".to_string(),
            None => format!(
                "{}@{}:{}/{}",
                self.database.user, self.database.host, self.database.port, self.database.name
            ),
        };
        let mail = if self.smtp.enabled {
            format!(
                "{}:{} as {} ({} -> {})",
                self.smtp.server, self.smtp.port, self.smtp.username, self.smtp.from, self.smtp.to
            )
        } else {
            "disabled (notifications are logged)".to_string()
        };
        let statuses = self.status_values();
        [
            format!("database: {database}"),
            format!(
                "table: {}.{} / {}",
                self.database.table, self.database.id_column, self.database.status_column
            ),
            format!(
                "statuses: pending={:?} archiving={:?} archived={:?} error={:?}",
                statuses.pending, statuses.archiving, statuses.archived, statuses.errored
            ),
            format!(
                "archive: {} ?{}=<id> timeout={}s",
                self.archive.archive_url, self.archive.query_param, self.archive.request_timeout_secs
            ),
            format!(
                "schedule: every {}s, max_concurrency={}",
                self.archive.check_interval, self.archive.max_concurrency
            ),
            format!("smtp: {mail}"),
        ]
        .join("\n")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub check_interval: Duration,
    pub max_concurrency: usize,
    pub shutdown_grace: Duration,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            max_concurrency: default_max_concurrency(),
            shutdown_grace: Duration::from_secs(default_shutdown_grace_secs()),
        }
    }
}

/// Everything a cycle needs, built once at startup.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn StatusStore>,
    pub client: Arc<dyn ArchiveClient>,
    pub notifier: Arc<dyn Notifier>,
    pub statuses: StatusValues,
    pub limits: PipelineLimits,
}

/// How one processor invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum RecordDisposition {
    Archived { file: String, status_persisted: bool },
    Errored { detail: String, status_persisted: bool },
    /// The claim write failed; the record stays pending for the next cycle.
    ClaimFailed,
    /// The record was no longer pending when claimed.
    LeaseLost,
}

impl RecordDisposition {
    /// Terminal outcome reached but its status write failed, leaving the
    /// record in the archiving status.
    pub fn is_stuck(&self) -> bool {
        matches!(
            self,
            RecordDisposition::Archived {
                status_persisted: false,
                ..
            } | RecordDisposition::Errored {
                status_persisted: false,
                ..
            }
        )
    }
}

pub struct RecordProcessor {
    ctx: PipelineContext,
}

impl RecordProcessor {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn process(&self, id: &RecordId) -> RecordDisposition {
        let span = info_span!("archive_record", record_id = %id);
        self.process_inner(id).instrument(span).await
    }

    async fn process_inner(&self, id: &RecordId) -> RecordDisposition {
        let statuses = &self.ctx.statuses;
        match self
            .ctx
            .store
            .claim(
                id,
                statuses.value_of(ArchiveStatus::Pending),
                statuses.value_of(ArchiveStatus::Archiving),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("record no longer pending, skipping");
                return RecordDisposition::LeaseLost;
            }
            Err(err) => {
                error!(error = %err, "failed to mark record archiving");
                return RecordDisposition::ClaimFailed;
            }
        }

        let outcome = match self.ctx.client.archive(id).await {
            Ok(outcome) => outcome,
            Err(err) => ArchiveOutcome::failed(err.to_string()),
        };

        if outcome.success {
            self.finish_archived(id, outcome.file).await
        } else {
            self.finish_errored(id, outcome.detail).await
        }
    }

    async fn finish_archived(&self, id: &RecordId, file: String) -> RecordDisposition {
        let status_persisted = self.write_terminal(id, ArchiveStatus::Archived).await;
        info!(file = %file, "record archived");
        self.ctx
            .notifier
            .notify(&Notification::archived(id, &file))
            .await;
        RecordDisposition::Archived {
            file,
            status_persisted,
        }
    }

    async fn finish_errored(&self, id: &RecordId, detail: String) -> RecordDisposition {
        warn!(error = %detail, "archive attempt failed");
        let status_persisted = self.write_terminal(id, ArchiveStatus::Errored).await;
        self.ctx
            .notifier
            .notify(&Notification::failed(id, &detail))
            .await;
        RecordDisposition::Errored {
            detail,
            status_persisted,
        }
    }

    async fn write_terminal(&self, id: &RecordId, next: ArchiveStatus) -> bool {
        debug_assert!(next.is_terminal() && ArchiveStatus::Archiving.can_transition_to(next));
        let value = self.ctx.statuses.value_of(next);
        match self.ctx.store.set_status(id, value).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    error = %err,
                    status = %next,
                    value,
                    record_id = %id,
                    "failed to write terminal status; record left in archiving status"
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub query_failed: bool,
    pub eligible: usize,
    pub skipped_rows: usize,
    pub archived: usize,
    pub errored: usize,
    pub claim_failed: usize,
    pub lease_lost: usize,
    pub stuck: usize,
    pub panicked: usize,
    /// Records whose unit panicked; they have no entry in `records`.
    pub panicked_records: Vec<RecordId>,
    pub records: BTreeMap<RecordId, RecordDisposition>,
}

impl CycleSummary {
    fn new(cycle_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            started_at,
            finished_at: started_at,
            query_failed: false,
            eligible: 0,
            skipped_rows: 0,
            archived: 0,
            errored: 0,
            claim_failed: 0,
            lease_lost: 0,
            stuck: 0,
            panicked: 0,
            panicked_records: Vec::new(),
            records: BTreeMap::new(),
        }
    }

    fn record(&mut self, id: RecordId, disposition: RecordDisposition) {
        match &disposition {
            RecordDisposition::Archived { .. } => self.archived += 1,
            RecordDisposition::Errored { .. } => self.errored += 1,
            RecordDisposition::ClaimFailed => self.claim_failed += 1,
            RecordDisposition::LeaseLost => self.lease_lost += 1,
        }
        if disposition.is_stuck() {
            error!(record_id = %id, "record stuck in archiving status, operator action required");
            self.stuck += 1;
        }
        self.records.insert(id, disposition);
    }

    pub fn log(&self) {
        if self.query_failed {
            return;
        }
        info!(
            cycle_id = %self.cycle_id,
            eligible = self.eligible,
            archived = self.archived,
            errored = self.errored,
            claim_failed = self.claim_failed,
            lease_lost = self.lease_lost,
            stuck = self.stuck,
            panicked = self.panicked,
            skipped_rows = self.skipped_rows,
            "archive cycle finished"
        );
    }
}

/// Runs cycles: one eligibility query, then one concurrent unit per record.
/// Units share a concurrency limiter across overlapping cycles.
pub struct ArchivePipeline {
    ctx: PipelineContext,
    processor: Arc<RecordProcessor>,
    limiter: Option<Arc<Semaphore>>,
}

impl ArchivePipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        let limiter = match ctx.limits.max_concurrency {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            processor: Arc::new(RecordProcessor::new(ctx.clone())),
            ctx,
            limiter,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub async fn run_cycle(&self) -> CycleSummary {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("archive_cycle", %cycle_id);
        self.run_cycle_inner(cycle_id).instrument(span).await
    }

    async fn run_cycle_inner(&self, cycle_id: Uuid) -> CycleSummary {
        let mut summary = CycleSummary::new(cycle_id, Utc::now());

        let batch = match self
            .ctx
            .store
            .select_by_status(&self.ctx.statuses.pending)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                error!(error = %err, "eligibility query failed, waiting for next cycle");
                summary.query_failed = true;
                summary.finished_at = Utc::now();
                return summary;
            }
        };

        summary.eligible = batch.ids.len();
        summary.skipped_rows = batch.skipped_rows;
        if batch.skipped_rows > 0 {
            warn!(skipped = batch.skipped_rows, "skipped unreadable record rows");
        }
        debug!(eligible = summary.eligible, "dispatching records");

        let mut units = JoinSet::new();
        let mut unit_records = HashMap::new();
        for id in batch.ids {
            let permit = match &self.limiter {
                Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!("concurrency limiter closed, stopping dispatch");
                        break;
                    }
                },
                None => None,
            };
            let processor = Arc::clone(&self.processor);
            let unit_id = id.clone();
            let handle = units.spawn(
                async move {
                    let _permit = permit;
                    let disposition = processor.process(&unit_id).await;
                    (unit_id, disposition)
                }
                .in_current_span(),
            );
            unit_records.insert(handle.id(), id);
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((id, disposition)) => summary.record(id, disposition),
                Err(err) => {
                    let record = unit_records.remove(&err.id());
                    match &record {
                        Some(id) => error!(
                            error = %err,
                            record_id = %id,
                            "archive unit did not complete; record may be left in archiving status"
                        ),
                        None => error!(error = %err, "archive unit did not complete"),
                    }
                    summary.panicked += 1;
                    summary.panicked_records.extend(record);
                }
            }
        }

        summary.finished_at = Utc::now();
        summary
    }
}

/// Starts one cycle on `cycles` unless the tracker has been closed for
/// shutdown. Returns whether a cycle was started.
fn spawn_cycle(cycles: &TaskTracker, pipeline: Arc<ArchivePipeline>) -> bool {
    if cycles.is_closed() {
        debug!("scheduler shutting down, tick ignored");
        return false;
    }
    cycles.spawn(async move {
        pipeline.run_cycle().await.log();
    });
    true
}

/// Drives [`ArchivePipeline::run_cycle`] on a fixed interval. Ticks are not
/// serialized; the claim in the status store keeps overlapping cycles from
/// processing the same record twice.
pub struct ArchiveScheduler {
    scheduler: JobScheduler,
    cycles: TaskTracker,
    shutdown_grace: Duration,
}

impl ArchiveScheduler {
    pub async fn start(pipeline: Arc<ArchivePipeline>) -> Result<Self> {
        let limits = pipeline.context().limits;
        let cycles = TaskTracker::new();
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;

        let job_cycles = cycles.clone();
        let job = Job::new_repeated_async(limits.check_interval, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let cycles = job_cycles.clone();
            Box::pin(async move {
                spawn_cycle(&cycles, pipeline);
            })
        })
        .with_context(|| {
            format!(
                "creating archive job every {}s",
                limits.check_interval.as_secs()
            )
        })?;
        scheduler.add(job).await.context("adding archive job")?;
        scheduler.start().await.context("starting scheduler")?;

        info!(
            interval_secs = limits.check_interval.as_secs(),
            max_concurrency = limits.max_concurrency,
            "archive scheduler started"
        );
        Ok(Self {
            scheduler,
            cycles,
            shutdown_grace: limits.shutdown_grace,
        })
    }

    /// Stops new cycles, then waits for in-flight cycles up to the grace
    /// period. Returns whether everything drained.
    pub async fn shutdown(mut self) -> Result<bool> {
        self.scheduler
            .shutdown()
            .await
            .context("stopping scheduler")?;
        self.cycles.close();
        let in_flight = self.cycles.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight archive cycles");
        }
        match tokio::time::timeout(self.shutdown_grace, self.cycles.wait()).await {
            Ok(()) => Ok(true),
            Err(_) => {
                warn!(
                    remaining = self.cycles.len(),
                    "shutdown grace period elapsed with archive cycles still running"
                );
                Ok(false)
            }
        }
    }
}

pub fn build_notifier(config: &AppConfig) -> Result<Arc<dyn Notifier>> {
    if !config.smtp.enabled {
        return Ok(Arc::new(LogNotifier));
    }
    let notifier = SmtpNotifier::new(&config.smtp_config()).context("building smtp notifier")?;
    Ok(Arc::new(notifier))
}

/// Connects the MySQL store and builds the HTTP client and notifier.
pub async fn build_context(config: &AppConfig) -> Result<PipelineContext> {
    let store = MySqlStatusStore::connect(
        config.connect_options()?,
        config.pool_settings(),
        config.record_table()?,
    )
    .await
    .context("connecting status store")?;
    let client = HttpArchiveClient::new(config.archive_client_config())
        .context("building archive client")?;

    Ok(PipelineContext {
        store: Arc::new(store),
        client: Arc::new(client),
        notifier: build_notifier(config)?,
        statuses: config.status_values(),
        limits: config.limits(),
    })
}

pub async fn run_once_from_config(config: &AppConfig) -> Result<CycleSummary> {
    let pipeline = ArchivePipeline::new(build_context(config).await?);
    let summary = pipeline.run_cycle().await;
    summary.log();
    if summary.query_failed {
        bail!("eligibility query failed");
    }
    Ok(summary)
}

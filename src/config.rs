use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use std::{env, fmt};
use uuid::Uuid;

/// Process-level configuration for the orchestrator daemon.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL used when issuing download links for result archives.
    pub public_url: String,
    /// Seconds between two sweeps of expired records.
    pub reaper_interval_secs: u64,
    /// Optional namespace prepended to every record key prefix.
    pub namespace: String,
    /// Key for signing download URLs. Random per process when unset, which
    /// invalidates issued URLs on restart.
    pub url_secret: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Background job orchestration daemon")]
pub struct Args {
    /// Host to bind to (overrides JOB_ORCHESTRATOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides JOB_ORCHESTRATOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where result blobs are stored (overrides JOB_ORCHESTRATOR_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides JOB_ORCHESTRATOR_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL for download links (overrides JOB_ORCHESTRATOR_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Reaper interval in seconds (overrides JOB_ORCHESTRATOR_REAPER_INTERVAL_SECS)
    #[arg(long)]
    pub reaper_interval_secs: Option<u64>,

    /// Download URL signing key (overrides JOB_ORCHESTRATOR_URL_SECRET)
    #[arg(long)]
    pub url_secret: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let env_host = env::var("JOB_ORCHESTRATOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("JOB_ORCHESTRATOR_PORT", 3000u16)?;
        let env_storage = env::var("JOB_ORCHESTRATOR_STORAGE_DIR")
            .unwrap_or_else(|_| "./data/results".into());
        let env_db = env::var("JOB_ORCHESTRATOR_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/jobs.db".into());
        let env_public = env::var("JOB_ORCHESTRATOR_PUBLIC_URL")
            .unwrap_or_else(|_| "http://localhost:3000/results".into());
        let env_reaper = parse_env("JOB_ORCHESTRATOR_REAPER_INTERVAL_SECS", 60u64)?;
        let namespace = env::var("JOB_ORCHESTRATOR_NAMESPACE").unwrap_or_default();
        let url_secret = match args.url_secret.or_else(|| env::var("JOB_ORCHESTRATOR_URL_SECRET").ok()) {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!("JOB_ORCHESTRATOR_URL_SECRET not set; using a random key for download URLs");
                Uuid::new_v4().simple().to_string()
            }
        };

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_url: args.public_url.unwrap_or(env_public),
            reaper_interval_secs: args.reaper_interval_secs.unwrap_or(env_reaper).max(1),
            namespace,
            url_secret,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Job settings for this deployment, namespaced if configured.
    pub fn jobs(&self) -> JobsConfig {
        JobsConfig::namespaced(&self.namespace)
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("public_url", &self.public_url)
            .field("reaper_interval_secs", &self.reaper_interval_secs)
            .field("namespace", &self.namespace)
            .field("url_secret", &"<redacted>")
            .finish()
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

/// Key prefixes separating the job families that share the record table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPrefixes {
    pub export_jobs: String,
    pub export_downloads: String,
    pub chunks: String,
    pub waiters: String,
    pub thumbnail: String,
    pub compare: String,
    pub convert: String,
    pub other: String,
}

impl Default for KeyPrefixes {
    fn default() -> Self {
        Self {
            export_jobs: "EXPORT#".into(),
            export_downloads: "DOWNLOAD#".into(),
            chunks: "CHUNK#".into(),
            waiters: "WAITER#".into(),
            thumbnail: "THUMBNAIL#".into(),
            compare: "COMPARE#".into(),
            convert: "CONVERT#".into(),
            other: "OTHER#".into(),
        }
    }
}

/// Leases, thresholds and key layout shared by every job manager.
///
/// Built once at startup and handed to each manager through
/// [`JobContext`](crate::services::context::JobContext). The lease values are
/// part of the persisted contract; change them only together with every reader.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub prefixes: KeyPrefixes,
    /// Sliding lease of export jobs and download records.
    pub export_lease: Duration,
    /// Lease of a chunk, refreshed when it moves to PROCESSING.
    pub chunk_lease: Duration,
    /// Lease of a generation request that is still loading.
    pub request_lease: Duration,
    /// Lease of a generation request that failed and may be retried.
    pub retry_lease: Duration,
    /// Lease of a settled generation request (ready or given up).
    pub settled_lease: Duration,
    /// Lease of a waiter subscription.
    pub subscription_lease: Duration,
    /// How long an issued download URL stays valid.
    pub download_url_lease: Duration,
    /// Consecutive UNAVAILABLE updates before a request is given up.
    pub failure_threshold: u32,
    /// Compare-and-swap attempts before a status update reports contention.
    pub cas_max_attempts: u32,
    /// Subscriptions fetched per store round trip while listing waiters.
    pub waiter_page_size: usize,
    /// Storage kinds whose pending chunk listing also returns PROCESSING chunks.
    pub in_flight_tolerant_storage_kinds: Vec<String>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            prefixes: KeyPrefixes::default(),
            export_lease: Duration::hours(2),
            chunk_lease: Duration::minutes(10),
            request_lease: Duration::days(1),
            retry_lease: Duration::hours(3),
            settled_lease: Duration::days(30),
            subscription_lease: Duration::days(1),
            download_url_lease: Duration::hours(1),
            failure_threshold: 3,
            cas_max_attempts: 16,
            waiter_page_size: 100,
            in_flight_tolerant_storage_kinds: vec!["sharepoint".into()],
        }
    }
}

impl JobsConfig {
    /// Default settings with every key prefix placed under `namespace`.
    pub fn namespaced(namespace: &str) -> Self {
        let mut cfg = Self::default();
        if namespace.is_empty() {
            return cfg;
        }
        let p = &mut cfg.prefixes;
        for prefix in [
            &mut p.export_jobs,
            &mut p.export_downloads,
            &mut p.chunks,
            &mut p.waiters,
            &mut p.thumbnail,
            &mut p.compare,
            &mut p.convert,
            &mut p.other,
        ] {
            *prefix = format!("{}:{}", namespace, prefix);
        }
        cfg
    }

    /// Whether pending chunk listings for `storage_kind` include PROCESSING chunks.
    pub fn tolerates_in_flight_chunks(&self, storage_kind: &str) -> bool {
        self.in_flight_tolerant_storage_kinds
            .iter()
            .any(|kind| kind.eq_ignore_ascii_case(storage_kind))
    }
}

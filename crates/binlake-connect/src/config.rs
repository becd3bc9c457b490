//! Configuration for the `binlake` binary
//!
//! YAML, with `${VAR}` and `${VAR:-default}` expanded from the environment
//! before parsing:
//!
//! ```yaml
//! source:
//!   host: mysql.internal
//!   user: cdc
//!   password: ${MYSQL_PASSWORD}
//!   databases: [shop]
//!   tables: [shop.orders, shop.customers]
//!   server_time_zone: Asia/Shanghai
//! destination:
//!   kind: doris
//!   fe_nodes: ["doris-fe:8030"]
//!   user: root
//!   password: ${DORIS_PASSWORD:-}
//!   mapping:
//!     shop.orders: dw.orders
//! checkpoint:
//!   dir: /var/lib/binlake
//! ```

use crate::destination::DorisConfig;
use crate::loader::BatchConfig;
use crate::pipeline::{PipelineConfig, StartupMode, TableMapping};
use crate::types::{DestinationTable, SensitiveString};
use binlake_cdc::{
    LogPosition, MySqlSourceConfig, RetryConfig, ServerTimeZone, SnapshotConfig, StreamConfig,
    TableId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BinlakeConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: String,

    pub source: SourceConfig,

    pub destination: DestinationConfig,

    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub snapshot: SnapshotSettings,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MySQL source
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub host: String,

    #[serde(default = "default_mysql_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: SensitiveString,

    /// Replica id; unique among the server's replicas
    #[serde(default = "default_server_id")]
    pub server_id: u32,

    pub databases: Vec<String>,

    /// Captured tables as `db.table`
    pub tables: Vec<String>,

    #[serde(default)]
    pub startup: StartupConfig,

    /// `UTC`, an offset such as `+08:00`, or an IANA zone
    #[serde(default = "default_time_zone")]
    pub server_time_zone: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Replication heartbeat period; 0 disables it
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Binlog reconnect attempts before the source gives up; -1 retries forever
    #[serde(default = "default_reconnect_retries")]
    pub max_reconnects: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupKind {
    #[default]
    Initial,
    Latest,
    Position,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StartupConfig {
    #[serde(default)]
    pub mode: StartupKind,

    /// `file:offset`, required for `mode: position`
    #[serde(default)]
    pub position: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    #[default]
    Doris,
    /// In-process warehouse, for dry runs
    Memory,
}

/// Destination warehouse
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DestinationConfig {
    #[serde(default)]
    pub kind: DestinationKind,

    /// Doris frontends as `host:http_port`
    #[serde(default)]
    pub fe_nodes: Vec<String>,

    #[serde(default = "default_doris_user")]
    pub user: String,

    #[serde(default)]
    pub password: SensitiveString,

    /// Target when exactly one table is captured
    #[serde(default)]
    pub table: Option<String>,

    /// `source db.table` → `destination db.table`; unmapped tables keep their name
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Batching and load retries
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoaderConfig {
    #[serde(default = "default_batch_max_events")]
    pub batch_max_events: usize,

    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,

    #[serde(default = "default_batch_max_delay_ms")]
    pub batch_max_delay_ms: u64,

    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Append a per-run id to the label prefix
    #[serde(default)]
    pub label_run_suffix: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    #[serde(default = "default_max_concurrent_loads")]
    pub max_concurrent_loads: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_max_events: default_batch_max_events(),
            batch_max_bytes: default_batch_max_bytes(),
            batch_max_delay_ms: default_batch_max_delay_ms(),
            label_prefix: default_label_prefix(),
            label_run_suffix: false,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            max_concurrent_loads: default_max_concurrent_loads(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotSettings {
    #[serde(default = "default_snapshot_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_table_attempts")]
    pub max_table_attempts: u32,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            batch_size: default_snapshot_batch_size(),
            max_table_attempts: default_max_table_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_server_id() -> u32 {
    5401
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_retries() -> i32 {
    10
}

fn default_doris_user() -> String {
    "root".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_batch_max_events() -> usize {
    10_000
}

fn default_batch_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_batch_max_delay_ms() -> u64 {
    5_000
}

fn default_label_prefix() -> String {
    "binlake".to_string()
}

fn default_max_retries() -> i32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_max_concurrent_loads() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_snapshot_batch_size() -> usize {
    10_000
}

fn default_max_table_attempts() -> u32 {
    3
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./binlake-checkpoints")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BinlakeConfig {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let source = &self.source;
        if source.host.is_empty() {
            anyhow::bail!("source.host must be set");
        }
        if source.port == 0 {
            anyhow::bail!("source.port must be non-zero");
        }
        if source.databases.is_empty() {
            anyhow::bail!("source.databases must list at least one database");
        }
        if source.tables.is_empty() {
            anyhow::bail!("source.tables must list at least one table");
        }

        let databases: HashSet<&str> = source.databases.iter().map(String::as_str).collect();
        let tables = self.source_tables()?;
        for table in &tables {
            if !databases.contains(table.database.as_str()) {
                anyhow::bail!(
                    "table '{}' is not in a listed database ({})",
                    table,
                    source.databases.join(", ")
                );
            }
        }

        self.startup_mode()?;
        self.server_time_zone()?;

        for key in self.destination.mapping.keys() {
            let id: TableId = key
                .parse()
                .map_err(|e| anyhow::anyhow!("destination.mapping: {}", e))?;
            if !tables.contains(&id) {
                anyhow::bail!("destination.mapping names '{}', which is not captured", key);
            }
        }
        if self.destination.table.is_some() && tables.len() != 1 {
            anyhow::bail!("destination.table applies to exactly one captured table; use destination.mapping");
        }
        let mappings = self.table_mappings()?;
        crate::pipeline::check_mappings(&mappings)?;

        if self.destination.kind == DestinationKind::Doris {
            if self.destination.fe_nodes.is_empty() {
                anyhow::bail!("destination.fe_nodes must list at least one Doris frontend");
            }
            DorisConfig::from(self).validate()?;
        }

        let loader = &self.loader;
        if loader.batch_max_events == 0 {
            anyhow::bail!("loader.batch_max_events must be greater than zero");
        }
        if loader.max_concurrent_loads == 0 {
            anyhow::bail!("loader.max_concurrent_loads must be greater than zero");
        }
        if loader.queue_capacity == 0 {
            anyhow::bail!("loader.queue_capacity must be greater than zero");
        }
        if loader.max_retries < -1 {
            anyhow::bail!("loader.max_retries must be -1 (forever) or at least 0");
        }
        if loader.label_prefix.is_empty()
            || !loader
                .label_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("loader.label_prefix may only contain letters, digits, '_' and '-'");
        }
        if self.snapshot.batch_size == 0 {
            anyhow::bail!("snapshot.batch_size must be greater than zero");
        }
        Ok(())
    }

    pub fn source_tables(&self) -> anyhow::Result<Vec<TableId>> {
        self.source
            .tables
            .iter()
            .map(|t| {
                t.parse::<TableId>()
                    .map_err(|e| anyhow::anyhow!("source.tables: {}", e))
            })
            .collect()
    }

    /// Destination of every captured table.
    pub fn table_mappings(&self) -> anyhow::Result<Vec<TableMapping>> {
        let tables = self.source_tables()?;
        let single = match &self.destination.table {
            Some(t) => Some(
                t.parse::<DestinationTable>()
                    .map_err(|e| anyhow::anyhow!("destination.table: {}", e))?,
            ),
            None => None,
        };
        tables
            .into_iter()
            .map(|source| {
                let destination = match (self.destination.mapping.get(&source.key()), &single) {
                    (Some(target), _) => target
                        .parse::<DestinationTable>()
                        .map_err(|e| anyhow::anyhow!("destination.mapping: {}", e))?,
                    (None, Some(single)) => single.clone(),
                    (None, None) => DestinationTable::from(&source),
                };
                Ok(TableMapping::new(source, destination))
            })
            .collect()
    }

    pub fn startup_mode(&self) -> anyhow::Result<StartupMode> {
        let startup = &self.source.startup;
        match (startup.mode, &startup.position) {
            (StartupKind::Initial, _) => Ok(StartupMode::Initial),
            (StartupKind::Latest, _) => Ok(StartupMode::Latest),
            (StartupKind::Position, Some(text)) => {
                let position: LogPosition = text
                    .parse()
                    .map_err(|e| anyhow::anyhow!("source.startup.position: {}", e))?;
                Ok(StartupMode::Position(position))
            }
            (StartupKind::Position, None) => {
                anyhow::bail!("source.startup.position is required for mode 'position'")
            }
        }
    }

    pub fn server_time_zone(&self) -> anyhow::Result<ServerTimeZone> {
        self.source
            .server_time_zone
            .parse()
            .map_err(|e| anyhow::anyhow!("source.server_time_zone: {}", e))
    }

    pub fn mysql_config(&self) -> MySqlSourceConfig {
        let source = &self.source;
        let mut config = MySqlSourceConfig::new(&source.host, &source.user)
            .with_port(source.port)
            .with_server_id(source.server_id)
            .with_connect_timeout(Duration::from_secs(source.connect_timeout_secs))
            .with_heartbeat(Duration::from_secs(source.heartbeat_secs));
        if !source.password.expose_secret().is_empty() {
            config = config.with_password(source.password.expose_secret());
        }
        config
    }

    pub fn load_retry(&self) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(self.loader.max_retries)
            .retry_delay(Duration::from_millis(self.loader.retry_delay_ms))
            .max_delay(Duration::from_millis(self.loader.max_retry_delay_ms))
            .build()
    }

    /// `run_id` is appended to the label prefix when `label_run_suffix` is set.
    pub fn batch_config(&self, run_id: &str) -> BatchConfig {
        let loader = &self.loader;
        let prefix = if loader.label_run_suffix {
            format!("{}_{}", loader.label_prefix, run_id)
        } else {
            loader.label_prefix.clone()
        };
        BatchConfig::builder()
            .max_events(loader.batch_max_events)
            .max_bytes(loader.batch_max_bytes)
            .max_delay(Duration::from_millis(loader.batch_max_delay_ms))
            .label_prefix(prefix)
            .retry(self.load_retry())
            .build()
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig::builder()
            .batch_size(self.snapshot.batch_size)
            .max_table_attempts(self.snapshot.max_table_attempts)
            .retry(self.load_retry())
            .build()
    }

    pub fn pipeline_config(&self, run_id: &str) -> anyhow::Result<PipelineConfig> {
        let reconnect = RetryConfig::builder()
            .max_retries(self.source.max_reconnects)
            .build();
        let stream = StreamConfig::default()
            .with_retry(reconnect)
            .with_server_time_zone(self.server_time_zone()?);
        Ok(PipelineConfig::new(self.table_mappings()?)
            .with_startup(self.startup_mode()?)
            .with_batch(self.batch_config(run_id))
            .with_snapshot(self.snapshot_config())
            .with_stream(stream)
            .with_max_concurrent_loads(self.loader.max_concurrent_loads)
            .with_queue_capacity(self.loader.queue_capacity))
    }
}

impl From<&BinlakeConfig> for DorisConfig {
    fn from(config: &BinlakeConfig) -> Self {
        let dest = &config.destination;
        DorisConfig::new(dest.fe_nodes.clone(), &dest.user)
            .with_password(dest.password.clone())
            .with_request_timeout(Duration::from_secs(dest.request_timeout_secs))
    }
}

//! MySQL binlog source
//!
//! [`MySqlConnector`] opens a replication connection per
//! [`LogConnector::open`]: it authenticates, aligns the checksum setting,
//! registers as a replica and requests a dump from the given position.

use super::protocol::{BinlogClient, ClientOptions};
use crate::common::{LogConnector, LogPosition, LogReader, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info};

/// MySQL replication source configuration
///
/// # Security Note
///
/// This struct implements a custom Debug that redacts the password field
/// to prevent accidental leakage to logs.
#[derive(Clone)]
pub struct MySqlSourceConfig {
    /// MySQL host
    pub host: String,
    /// MySQL port (default: 3306)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Server ID for replication (must be unique among all replicas)
    pub server_id: u32,
    pub connect_timeout: Duration,
    /// Heartbeat period the server is asked to keep; silence for three
    /// periods drops the connection
    pub heartbeat: Duration,
}

impl std::fmt::Debug for MySqlSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_id", &self.server_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl Default for MySqlSourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            server_id: 5401,
            connect_timeout: Duration::from_secs(10),
            heartbeat: Duration::from_secs(30),
        }
    }
}

impl MySqlSourceConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: (!self.heartbeat.is_zero()).then(|| self.heartbeat * 3),
        }
    }

    /// `mysql_async` connection URL for metadata and snapshot queries.
    pub fn url(&self) -> String {
        let mut url = format!("mysql://{}", encode(&self.user));
        if let Some(password) = &self.password {
            url.push(':');
            url.push_str(&encode(password));
        }
        url.push_str(&format!("@{}:{}", self.host, self.port));
        url
    }
}

/// Percent-encode a URL userinfo component.
fn encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// [`LogConnector`] for a MySQL server.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    config: MySqlSourceConfig,
}

impl MySqlConnector {
    pub fn new(config: MySqlSourceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MySqlSourceConfig {
        &self.config
    }
}

#[async_trait]
impl LogConnector for MySqlConnector {
    async fn open(&self, from: &LogPosition) -> Result<Box<dyn LogReader>> {
        let mut client = BinlogClient::connect(&self.config.client_options()).await?;

        // Without this the server strips checksums, and FDE detection
        // would disagree with the events that follow.
        client
            .execute("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await?;
        client
            .execute("SET @source_binlog_checksum = @@global.binlog_checksum")
            .await?;
        if !self.config.heartbeat.is_zero() {
            let nanos = self.config.heartbeat.as_nanos();
            client
                .execute(&format!("SET @master_heartbeat_period = {}", nanos))
                .await?;
            client
                .execute(&format!("SET @source_heartbeat_period = {}", nanos))
                .await?;
        }

        client.register_replica(self.config.server_id).await?;
        let offset = from.offset.max(4);
        client
            .binlog_dump(self.config.server_id, &from.file, offset)
            .await?;
        info!(
            file = %from.file,
            offset,
            server_version = client.server_version(),
            connection_id = client.connection_id(),
            "MySQL binlog connection ready"
        );
        Ok(Box::new(MySqlLogReader { client }))
    }
}

/// One dump connection; every packet is one binlog event.
#[derive(Debug)]
pub struct MySqlLogReader {
    client: BinlogClient,
}

#[async_trait]
impl LogReader for MySqlLogReader {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let event = self.client.next_event().await?;
        if event.is_none() {
            debug!("Server ended the binlog dump");
        }
        Ok(event)
    }
}

//! MySQL replication protocol
//!
//! Just enough of the client/server protocol to follow a binlog:
//! - Handshake and authentication (mysql_native_password, caching_sha2_password fast path)
//! - COM_QUERY for session variables
//! - COM_REGISTER_SLAVE
//! - COM_BINLOG_DUMP and event streaming
//!
//! Transport failures surface as [`CdcError::ConnectionLost`] so the change
//! stream can reconnect; server-reported errors surface as [`CdcError::MySql`].

use super::decoder::Reader;
use crate::common::{CdcError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// MySQL packet header size (4 bytes: 3 for length + 1 for sequence)
const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload
const MAX_PACKET_SIZE: usize = 16_777_215;

/// utf8mb4_general_ci
const CHARSET_UTF8MB4: u8 = 45;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

/// MySQL capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    pub fn has(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Server error packet (`0xFF`) as a [`CdcError`].
fn server_error(context: &str, packet: &[u8]) -> CdcError {
    let mut r = Reader::new(packet);
    let code = r.skip(1).and_then(|_| r.u16()).unwrap_or(0);
    // Protocol 4.1 adds '#' and a five character SQL state.
    let rest = r.rest();
    let message = match rest.first() {
        Some(b'#') if rest.len() >= 6 => &rest[6..],
        _ => rest,
    };
    CdcError::mysql(format!(
        "{}: {} - {}",
        context,
        code,
        String::from_utf8_lossy(message)
    ))
}

fn io_error(context: &str, e: std::io::Error) -> CdcError {
    CdcError::connection_lost(format!("{}: {}", context, e))
}

// ============================================================================
// Handshake Packet
// ============================================================================

/// MySQL handshake packet (initial greeting from server)
#[derive(Debug, Clone)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: CapabilityFlags,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_data: Vec<u8>,
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let malformed = |e: crate::common::DecodeError| {
            CdcError::mysql(format!("malformed handshake packet: {}", e))
        };
        let mut r = Reader::new(data);

        let protocol_version = r.u8().map_err(malformed)?;
        if protocol_version == 0xFF {
            return Err(server_error("connection refused", data));
        }
        let server_version = read_null_terminated(&mut r).map_err(malformed)?;
        let connection_id = r.u32().map_err(malformed)?;
        let mut auth_data = r.take(8).map_err(malformed)?.to_vec();
        r.skip(1).map_err(malformed)?; // filler
        let cap_lower = r.u16().map_err(malformed)?;
        let character_set = r.u8().map_err(malformed)?;
        let status_flags = r.u16().map_err(malformed)?;
        let cap_upper = r.u16().map_err(malformed)?;
        let capability_flags =
            CapabilityFlags::new((u32::from(cap_upper) << 16) | u32::from(cap_lower));
        let auth_data_len = r.u8().map_err(malformed)? as usize;
        r.skip(10).map_err(malformed)?; // reserved

        // Part 2 of the scramble: max(13, len - 8) bytes, null terminated.
        let part2_len = auth_data_len.saturating_sub(8).max(13).min(r.remaining());
        let part2 = r.take(part2_len).map_err(malformed)?;
        let part2 = part2.split(|b| *b == 0).next().unwrap_or_default();
        auth_data.extend_from_slice(part2);

        let auth_plugin_name = if capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            read_null_terminated(&mut r).unwrap_or_default()
        } else {
            "mysql_native_password".to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            auth_data,
            auth_plugin_name,
        })
    }
}

fn read_null_terminated(r: &mut Reader<'_>) -> std::result::Result<String, crate::common::DecodeError> {
    let mut bytes = Vec::new();
    loop {
        match r.u8() {
            Ok(0) => break,
            Ok(b) => bytes.push(b),
            Err(e) if bytes.is_empty() => return Err(e),
            Err(_) => break,
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ============================================================================
// Binlog Client
// ============================================================================

/// Connection settings for [`BinlogClient::connect`].
#[derive(Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    /// Reads that stay silent longer than this fail the connection
    pub read_timeout: Option<Duration>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

/// MySQL binlog client for replication
pub struct BinlogClient {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
    read_timeout: Option<Duration>,
}

impl std::fmt::Debug for BinlogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogClient")
            .field("sequence_id", &self.sequence_id)
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl BinlogClient {
    /// Connect to the server and authenticate.
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        let addr = format!("{}:{}", options.host, options.port);
        debug!(addr = %addr, "Connecting to MySQL");

        let tcp = timeout(options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                CdcError::connection_lost(format!(
                    "connect to {} timed out after {:?}",
                    addr, options.connect_timeout
                ))
            })?
            .map_err(|e| io_error(&format!("connect to {}", addr), e))?;
        tcp.set_nodelay(true)
            .map_err(|e| io_error("set TCP_NODELAY", e))?;

        let mut client = Self {
            stream: BufReader::new(tcp),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
            read_timeout: Some(options.connect_timeout),
        };

        let greeting = client.read_packet().await?;
        let handshake = HandshakePacket::parse(&greeting)?;
        info!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            auth_plugin = %handshake.auth_plugin_name,
            "Connected to MySQL"
        );
        client.server_version = handshake.server_version.clone();
        client.connection_id = handshake.connection_id;

        client
            .authenticate(&options.user, options.password.as_deref(), &handshake)
            .await?;
        client.read_timeout = options.read_timeout;
        Ok(client)
    }

    /// Get server version
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Get connection ID
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Read one logical packet, joining continuation packets of
    /// payloads at the 16 MiB limit.
    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            self.read_exact(&mut header).await?;
            let len = usize::from(header[0])
                | (usize::from(header[1]) << 8)
                | (usize::from(header[2]) << 16);
            self.sequence_id = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + len, 0);
            self.read_exact(&mut payload[start..]).await?;
            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let read = self.stream.read_exact(buf);
        match self.read_timeout {
            Some(limit) => timeout(limit, read)
                .await
                .map_err(|_| {
                    CdcError::connection_lost(format!("no data from server for {:?}", limit))
                })?
                .map(|_| ())
                .map_err(|e| io_error("read", e)),
            None => read.await.map(|_| ()).map_err(|e| io_error("read", e)),
        }
    }

    /// Write a MySQL packet
    async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len >= MAX_PACKET_SIZE {
            return Err(CdcError::mysql(format!("packet too large: {} bytes", len)));
        }

        let mut packet = BytesMut::with_capacity(PACKET_HEADER_SIZE + len);
        packet.put_uint_le(len as u64, 3);
        packet.put_u8(self.sequence_id);
        packet.put_slice(data);

        let stream = self.stream.get_mut();
        stream
            .write_all(&packet)
            .await
            .map_err(|e| io_error("write", e))?;
        stream.flush().await.map_err(|e| io_error("flush", e))?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        handshake: &HandshakePacket,
    ) -> Result<()> {
        let client_flags = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_TRANSACTIONS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_DEPRECATE_EOF;

        let plugin = match handshake.auth_plugin_name.as_str() {
            p @ ("mysql_native_password" | "caching_sha2_password") => p,
            other => {
                warn!(plugin = other, "Unknown auth plugin, trying mysql_native_password");
                "mysql_native_password"
            }
        };
        let auth_response = scramble(plugin, password, &handshake.auth_data)?;

        let mut response = BytesMut::with_capacity(128 + user.len());
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(CHARSET_UTF8MB4);
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        response.put_slice(plugin.as_bytes());
        response.put_u8(0);

        self.write_packet(&response).await?;
        self.read_auth_result(plugin, password).await
    }

    /// Handle OK / ERR / auth switch / caching_sha2 fast-auth replies.
    async fn read_auth_result(&mut self, plugin: &str, password: Option<&str>) -> Result<()> {
        let mut plugin = plugin.to_string();
        // Bounded: one switch, one fast-auth status.
        for _ in 0..3 {
            let resp = self.read_packet().await?;
            match resp.first() {
                Some(0x00) => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                Some(0xFF) => return Err(server_error("authentication failed", &resp)),
                Some(0xFE) => {
                    let mut r = Reader::new(&resp[1..]);
                    let switched = read_null_terminated(&mut r).unwrap_or_default();
                    let salt = r.rest();
                    let salt = salt.strip_suffix(&[0]).unwrap_or(salt);
                    debug!(plugin = %switched, "Auth switch requested");
                    let reply = scramble(&switched, password, salt)?;
                    self.write_packet(&reply).await?;
                    plugin = switched;
                }
                Some(0x01) if plugin == "caching_sha2_password" => match resp.get(1) {
                    Some(0x03) => debug!("caching_sha2_password fast auth succeeded"),
                    Some(0x04) => {
                        return Err(CdcError::mysql(
                            "caching_sha2_password full authentication needs a secure \
                             connection; use mysql_native_password for the replication user",
                        ))
                    }
                    other => {
                        return Err(CdcError::mysql(format!(
                            "unexpected caching_sha2_password status {:?}",
                            other
                        )))
                    }
                },
                other => {
                    return Err(CdcError::mysql(format!(
                        "unexpected authentication reply {:?}",
                        other
                    )))
                }
            }
        }
        Err(CdcError::mysql("authentication did not complete"))
    }

    /// Execute a statement that returns no rows (`SET ...`).
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(COM_QUERY);
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(server_error(sql, &resp)),
            _ => Err(CdcError::mysql(format!(
                "statement returned a result set: {}",
                sql
            ))),
        }
    }

    /// Register as a replica
    pub async fn register_replica(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(COM_REGISTER_SLAVE);
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank (ignored)
        packet.put_u32_le(0); // master id
        self.write_packet(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => {
                debug!(server_id, "Registered as replica");
                Ok(())
            }
            Some(0xFF) => Err(server_error("register replica", &resp)),
            _ => Err(CdcError::mysql("unexpected response to COM_REGISTER_SLAVE")),
        }
    }

    /// Start streaming from `file` at byte `position`.
    pub async fn binlog_dump(&mut self, server_id: u32, file: &str, position: u64) -> Result<()> {
        let position = u32::try_from(position).map_err(|_| {
            CdcError::config(format!("binlog offset {} does not fit COM_BINLOG_DUMP", position))
        })?;
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(file.len() + 11);
        packet.put_u8(COM_BINLOG_DUMP);
        packet.put_u32_le(position);
        packet.put_u16_le(0); // flags: block at end of log
        packet.put_u32_le(server_id);
        packet.put_slice(file.as_bytes());
        self.write_packet(&packet).await?;
        info!(file, position, "Started binlog dump");
        Ok(())
    }

    /// Next raw event (status byte stripped). `None` on EOF.
    pub async fn next_event(&mut self) -> Result<Option<Bytes>> {
        let packet = self.read_packet().await?;
        match packet.first() {
            None => Ok(None),
            Some(0x00) => Ok(Some(Bytes::from(packet).slice(1..))),
            Some(0xFE) if packet.len() < 9 => {
                debug!("Received EOF in binlog stream");
                Ok(None)
            }
            Some(0xFF) => Err(server_error("binlog stream", &packet)),
            Some(other) => Err(CdcError::mysql(format!(
                "unexpected binlog packet status {:#04x}",
                other
            ))),
        }
    }
}

/// Auth response for `plugin`.
fn scramble(plugin: &str, password: Option<&str>, salt: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        "mysql_native_password" => Ok(mysql_native_password(password, salt)),
        "caching_sha2_password" => Ok(caching_sha2_password(password, salt)),
        other => Err(CdcError::mysql(format!("unsupported auth plugin {}", other))),
    }
}

/// SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
fn mysql_native_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    let Some(pwd) = password.filter(|p| !p.is_empty()) else {
        return Vec::new();
    };
    let stage1 = Sha1::digest(pwd.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + salt))
fn caching_sha2_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    let Some(pwd) = password.filter(|p| !p.is_empty()) else {
        return Vec::new();
    };
    let hash1 = Sha256::digest(pwd.as_bytes());
    let hash2 = Sha256::digest(hash1);
    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(salt);
    let hash3 = hasher.finalize();
    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

//! Interfaces to the systems around the exchange core: configuration cache,
//! history cache, discovery, availability, tasks and user sessions.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use proxy_wire::{Compatibility, Version};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::clock::unix_now;
use crate::connection::RedirectDirective;
use crate::record::{
    AutoregRecord, DiscoveryRecord, HistoryRecord, HostActiveStatus, InterfaceAvailability, Record,
    TaskRecord,
};
use crate::store::StagingStore;

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{0}")]
    Failed(String),
    #[error("{0} is not available")]
    Unavailable(&'static str),
}

pub type CollabResult<T> = Result<T, CollaboratorError>;

/// Transport security negotiated on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Unencrypted,
    Psk,
    Cert,
}

impl ConnectionType {
    pub fn bit(self) -> u8 {
        match self {
            ConnectionType::Unencrypted => 0x01,
            ConnectionType::Psk => 0x02,
            ConnectionType::Cert => 0x04,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Unencrypted => "unencrypted",
            ConnectionType::Psk => "psk",
            ConnectionType::Cert => "cert",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitmask of connection types a peer may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsAccept(pub u8);

impl TlsAccept {
    pub const UNENCRYPTED: TlsAccept = TlsAccept(0x01);
    pub const ANY: TlsAccept = TlsAccept(0x07);

    pub fn allows(self, connection: ConnectionType) -> bool {
        self.0 & connection.bit() != 0
    }
}

impl Default for TlsAccept {
    fn default() -> Self {
        Self::UNENCRYPTED
    }
}

/// Identity facts about the remote end of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: String,
    pub connection: ConnectionType,
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub psk_identity: Option<String>,
}

impl PeerInfo {
    pub fn unencrypted(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connection: ConnectionType::Unencrypted,
            issuer: None,
            subject: None,
            psk_identity: None,
        }
    }

    /// Whether the peer address appears in `allowed`. Entries are compared as
    /// IP addresses when both sides parse, otherwise as text.
    pub fn matches_any(&self, allowed: &[String]) -> bool {
        let peer: Option<IpAddr> = self.address.parse().ok();
        allowed.iter().map(|entry| entry.trim()).any(|entry| {
            match (peer, entry.parse::<IpAddr>().ok()) {
                (Some(peer), Some(entry)) => peer == entry,
                _ => entry.eq_ignore_ascii_case(&self.address),
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Trapper,
    AgentActive,
    Agent,
    Calculated,
    Internal,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub itemid: u64,
    pub hostid: u64,
    pub host: String,
    pub key: String,
    pub item_type: ItemType,
    /// Proxy monitoring the item's host, if any.
    pub proxyid: Option<u64>,
    /// Addresses allowed to push trapper values; empty allows everyone.
    pub trapper_hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostLookup {
    Found(u64),
    /// The host is served by another node.
    Redirect(RedirectDirective),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Active,
    Passive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub proxyid: u64,
    pub name: String,
    pub mode: ProxyMode,
    /// Address the server polls a passive proxy on.
    pub address: String,
    pub port: u16,
    /// Peers an active proxy may connect from; empty allows any.
    pub allowed_addresses: Vec<String>,
    pub tls_accept: TlsAccept,
    pub tls_issuer: Option<String>,
    pub tls_subject: Option<String>,
    pub psk_identity: Option<String>,
}

/// Runtime facts the server keeps per proxy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyRuntime {
    pub version: Option<Version>,
    pub compatibility: Option<Compatibility>,
    pub lastaccess: i64,
    pub compress: bool,
    /// Last time communication was refused because of a configuration error.
    pub last_cfg_error_time: i64,
    pub proxy_delay: i64,
    pub more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveCheck {
    pub key: String,
    pub delay: String,
    pub lastlogsize: u64,
    pub mtime: i64,
}

/// Changes in availability not yet acknowledged upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub revision: u64,
    pub interfaces: Vec<InterfaceAvailability>,
    pub hosts: Vec<HostActiveStatus>,
}

impl AvailabilitySnapshot {
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty() && self.hosts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UserRole {
    User,
    Admin,
    SuperAdmin,
}

#[async_trait]
pub trait ConfigCache: Send + Sync {
    async fn item_by_id(&self, itemid: u64) -> Option<ItemInfo>;

    async fn item_by_key(&self, host: &str, key: &str) -> Option<ItemInfo>;

    async fn host_by_name(&self, host: &str, peer: &PeerInfo) -> HostLookup;

    /// Proxy monitoring `hostid`; `None` when the local node monitors it.
    async fn host_proxy(&self, hostid: u64) -> Option<u64>;

    async fn proxy_by_name(&self, name: &str) -> Option<ProxyRecord>;

    async fn passive_proxies(&self) -> Vec<ProxyRecord>;

    async fn hosts_of_proxy(&self, proxyid: u64) -> Vec<u64>;

    async fn proxy_runtime(&self, proxyid: u64) -> ProxyRuntime;

    async fn update_proxy_runtime(&self, proxyid: u64, runtime: ProxyRuntime);

    /// Unix time of the last configuration cache reload.
    async fn last_reload(&self) -> i64;

    /// Configuration payload a proxy should install.
    async fn proxy_config(&self, proxy: &ProxyRecord) -> CollabResult<Value>;

    async fn install_proxy_config(&self, config: Value) -> CollabResult<()>;

    async fn active_checks(&self, host: &str) -> CollabResult<Vec<ActiveCheck>>;

    async fn queue_overview(&self) -> Value;
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn accept(&self, values: Vec<HistoryRecord>) -> CollabResult<()>;
}

#[async_trait]
pub trait DiscoverySink: Send + Sync {
    async fn discovered(&self, proxyid: Option<u64>, records: Vec<DiscoveryRecord>) -> CollabResult<()>;

    async fn autoregistered(&self, proxyid: Option<u64>, records: Vec<AutoregRecord>) -> CollabResult<()>;
}

#[async_trait]
pub trait AvailabilityManager: Send + Sync {
    async fn apply_interfaces(&self, records: Vec<InterfaceAvailability>) -> CollabResult<()>;

    async fn apply_active_status(&self, records: Vec<HostActiveStatus>) -> CollabResult<()>;

    async fn active_heartbeat(&self, hostid: u64, frequency: i64) -> CollabResult<()>;

    async fn pending(&self) -> AvailabilitySnapshot;

    async fn acknowledge(&self, revision: u64);
}

#[async_trait]
pub trait TaskManager: Send + Sync {
    /// Remote commands waiting to be handed to a proxy.
    async fn pending_for_proxy(&self, proxyid: u64) -> CollabResult<Vec<TaskRecord>>;

    async fn mark_in_progress(&self, taskids: &[u64]) -> CollabResult<()>;

    async fn save_received(&self, proxyid: Option<u64>, tasks: Vec<TaskRecord>) -> CollabResult<()>;

    async fn run_command(&self, request: &Map<String, Value>) -> CollabResult<String>;
}

#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn session_role(&self, sid: &str) -> Option<UserRole>;
}

/// History sink of a proxy: values are buffered for upstream delivery.
///
/// Appends happen under the staging lock, the same one batch assembly takes,
/// so a batch never sees half of a delivered chunk.
pub struct StagingHistorySink {
    store: Arc<dyn StagingStore>,
    lock: Arc<Mutex<()>>,
}

impl StagingHistorySink {
    pub fn new(store: Arc<dyn StagingStore>, lock: Arc<Mutex<()>>) -> Self {
        Self { store, lock }
    }
}

#[async_trait]
impl HistorySink for StagingHistorySink {
    async fn accept(&self, values: Vec<HistoryRecord>) -> CollabResult<()> {
        let _guard = self.lock.lock().await;
        let now = unix_now();
        for value in values {
            self.store
                .append(Record::History(value), now)
                .await
                .map_err(|err| CollaboratorError::Failed(err.to_string()))?;
        }
        Ok(())
    }
}

/// Every collaborator a node runs with.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn StagingStore>,
    pub config: Arc<dyn ConfigCache>,
    pub history: Arc<dyn HistorySink>,
    pub discovery: Arc<dyn DiscoverySink>,
    pub availability: Arc<dyn AvailabilityManager>,
    pub tasks: Arc<dyn TaskManager>,
    pub access: Arc<dyn AccessControl>,
    /// Serializes batch assembly against local buffering on proxies.
    pub staging_lock: Arc<Mutex<()>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_accept_mask_checks_bits() {
        assert!(TlsAccept::default().allows(ConnectionType::Unencrypted));
        assert!(!TlsAccept::default().allows(ConnectionType::Psk));
        assert!(TlsAccept(0x06).allows(ConnectionType::Cert));
        assert!(TlsAccept::ANY.allows(ConnectionType::Psk));
    }

    #[test]
    fn peer_matching_compares_addresses() {
        let peer = PeerInfo::unencrypted("127.0.0.1");
        assert!(peer.matches_any(&["10.0.0.1".into(), " 127.0.0.1".into()]));
        assert!(!peer.matches_any(&["127.0.0.2".into()]));
        assert!(!peer.matches_any(&[]));
        let v6 = PeerInfo::unencrypted("::1");
        assert!(v6.matches_any(&["0:0:0:0:0:0:0:1".into()]));
    }

    #[test]
    fn roles_are_ordered() {
        assert!(UserRole::SuperAdmin > UserRole::Admin);
        assert!(UserRole::User < UserRole::Admin);
    }
}

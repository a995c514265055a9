#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use proxy_exchange::collab::{ItemInfo, ItemType, TlsAccept};
use proxy_exchange::record::{HistoryRecord, Record};
use proxy_exchange::{
    spawn_listener, Dispatcher, ExchangeContext, MemoryServices, ProgramType, ProxyMode, ProxyRecord, StagingStore,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const PROXY_ID: u64 = 7;
pub const PROXY_NAME: &str = "edge-7";

pub struct Node {
    pub memory: MemoryServices,
    pub ctx: Arc<ExchangeContext>,
    pub addr: SocketAddr,
    pub listener: JoinHandle<()>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Starts a trapper for `role` on an ephemeral local port.
pub async fn start_node(role: ProgramType) -> Node {
    let memory = MemoryServices::new();
    let services = if role.is_proxy() { memory.proxy() } else { memory.server() };
    let ctx = Arc::new(ExchangeContext::new(role, services).with_hostname(PROXY_NAME));
    start_with(memory, ctx).await
}

pub async fn start_with(memory: MemoryServices, ctx: Arc<ExchangeContext>) -> Node {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = spawn_listener(listener, Arc::new(Dispatcher::new(Arc::clone(&ctx))));
    Node {
        memory,
        ctx,
        addr,
        listener: handle,
    }
}

pub fn proxy_record(mode: ProxyMode, addr: Option<SocketAddr>) -> ProxyRecord {
    ProxyRecord {
        proxyid: PROXY_ID,
        name: PROXY_NAME.to_string(),
        mode,
        address: addr.map(|addr| addr.ip().to_string()).unwrap_or_default(),
        port: addr.map(|addr| addr.port()).unwrap_or(10051),
        allowed_addresses: Vec::new(),
        tls_accept: TlsAccept::default(),
        tls_issuer: None,
        tls_subject: None,
        psk_identity: None,
    }
}

/// Registers items 1..=count on a host monitored by the test proxy.
pub fn add_proxy_items(memory: &MemoryServices, count: u64) {
    memory.config.add_host("db01", 30, Some(PROXY_ID));
    for itemid in 1..=count {
        memory.config.add_item(ItemInfo {
            itemid,
            hostid: 30,
            host: "db01".to_string(),
            key: format!("metric[{itemid}]"),
            item_type: ItemType::Agent,
            proxyid: Some(PROXY_ID),
            trapper_hosts: Vec::new(),
        });
    }
}

/// Buffers one history value per item id on a proxy.
pub async fn stage_history(memory: &MemoryServices, itemids: impl IntoIterator<Item = u64>) {
    for itemid in itemids {
        let record = HistoryRecord {
            itemid,
            clock: 1_700_000_000,
            ns: itemid as i64,
            value: Some(format!("v{itemid}")),
            ..HistoryRecord::default()
        };
        memory
            .store
            .append(Record::History(record), 1_700_000_000)
            .await
            .expect("append");
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

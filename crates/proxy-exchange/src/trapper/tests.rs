use std::sync::Arc;

use proxy_wire::tags::field;
use proxy_wire::{read_frame, write_frame, Envelope, FrameConfig, FrameError, RequestTag};
use serde_json::json;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use super::*;
use crate::collab::{ActiveCheck, ItemInfo, ItemType, PeerInfo, ProxyMode, ProxyRecord, TlsAccept, UserRole};
use crate::context::{ExchangeContext, ProgramType};
use crate::memory::MemoryServices;
use crate::record::{HistoryRecord, Record, Stream, TaskRecord};
use crate::store::StagingStore;

const PEER: &str = "192.0.2.10";

fn dispatcher(role: ProgramType) -> (MemoryServices, Arc<Dispatcher>) {
    let memory = MemoryServices::new();
    let services = if role.is_proxy() { memory.proxy() } else { memory.server() };
    let ctx = ExchangeContext::new(role, services).with_hostname("edge");
    (memory, Arc::new(Dispatcher::new(Arc::new(ctx))))
}

fn trapper_item(itemid: u64, host: &str, key: &str) -> ItemInfo {
    ItemInfo {
        itemid,
        hostid: 10,
        host: host.to_string(),
        key: key.to_string(),
        item_type: ItemType::Trapper,
        proxyid: None,
        trapper_hosts: Vec::new(),
    }
}

fn active_proxy(proxyid: u64, name: &str) -> ProxyRecord {
    ProxyRecord {
        proxyid,
        name: name.to_string(),
        mode: ProxyMode::Active,
        address: String::new(),
        port: 10051,
        allowed_addresses: Vec::new(),
        tls_accept: TlsAccept::default(),
        tls_issuer: None,
        tls_subject: None,
        psk_identity: None,
    }
}

fn serve(dispatcher: &Arc<Dispatcher>) -> (DuplexStream, JoinHandle<ExchangeResult<()>>) {
    let (client, server) = duplex(64 * 1024);
    let dispatcher = Arc::clone(dispatcher);
    let handle = tokio::spawn(async move { dispatcher.serve(server, PeerInfo::unencrypted(PEER)).await });
    (client, handle)
}

async fn send(client: &mut DuplexStream, envelope: &Envelope) {
    write_frame(client, &envelope.encode().expect("encode"), &FrameConfig::default())
        .await
        .expect("write request");
}

/// Reads the reply, `None` when the server closed without answering.
async fn reply(client: &mut DuplexStream) -> Option<Envelope> {
    match read_frame(client, &FrameConfig::default()).await {
        Ok(frame) => Some(Envelope::decode(&frame.payload).expect("reply is an envelope")),
        Err(FrameError::Closed) => None,
        Err(err) => panic!("unexpected frame error: {err}"),
    }
}

async fn request(dispatcher: &Arc<Dispatcher>, envelope: Envelope) -> Option<Envelope> {
    let (mut client, handle) = serve(dispatcher);
    send(&mut client, &envelope).await;
    let answer = reply(&mut client).await;
    handle.await.expect("join").expect("handled");
    answer
}

async fn raw_request(dispatcher: &Arc<Dispatcher>, payload: &[u8]) -> Vec<u8> {
    let (mut client, handle) = serve(dispatcher);
    client.write_all(payload).await.expect("write");
    client.shutdown().await.expect("shutdown");
    let mut answer = Vec::new();
    client.read_to_end(&mut answer).await.expect("read");
    handle.await.expect("join").expect("handled");
    answer
}

#[tokio::test]
async fn invalid_json_is_answered_with_failure() {
    let (_, dispatcher) = dispatcher(ProgramType::Server);
    let (mut client, handle) = serve(&dispatcher);
    write_frame(&mut client, b"{\"request\":", &FrameConfig::default())
        .await
        .unwrap();
    let answer = reply(&mut client).await.expect("failure reply");
    assert!(!answer.is_success());
    assert!(answer.info.is_some());
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_request_is_dropped_without_reply() {
    let (_, dispatcher) = dispatcher(ProgramType::Server);
    let answer = request(&dispatcher, Envelope::raw_request("bogus request")).await;
    assert!(answer.is_none());
}

#[tokio::test]
async fn routes_follow_the_node_role() {
    let (_, server) = dispatcher(ProgramType::Server);
    assert!(server.handles(RequestTag::ProxyHeartbeat));
    assert!(server.handles(RequestTag::GetQueue));
    assert!(!server.handles(RequestTag::ProxyTasks));

    let (_, passive) = dispatcher(ProgramType::ProxyPassive);
    assert!(passive.handles(RequestTag::ProxyTasks));
    assert!(passive.handles(RequestTag::AgentData));
    assert!(!passive.handles(RequestTag::GetQueue));

    let (_, active) = dispatcher(ProgramType::ProxyActive);
    assert!(active.handles(RequestTag::ProxyConfig));
    assert!(!active.handles(RequestTag::HistoryData));
}

#[tokio::test]
async fn active_proxy_reports_misconfiguration() {
    let (_, dispatcher) = dispatcher(ProgramType::ProxyActive);
    for _ in 0..2 {
        let answer = request(&dispatcher, Envelope::request(RequestTag::ProxyData))
            .await
            .expect("failure reply");
        assert!(!answer.is_success());
        let info = answer.info.unwrap();
        assert!(info.starts_with("misconfiguration error"), "{info}");
        assert!(info.contains(PEER));
    }
    // The warning was already spent on the first request.
    assert!(!dispatcher.context().throttle.first_time("misconfigured:proxy data"));
}

#[tokio::test]
async fn legacy_value_is_acknowledged_with_plain_ok() {
    let (memory, dispatcher) = dispatcher(ProgramType::Server);
    memory.config.add_host("web01", 10, None);
    memory.config.add_item(trapper_item(100, "web01", "app.status"));

    let answer = raw_request(&dispatcher, b"web01:app.status:running\n").await;
    assert_eq!(answer, b"OK");
    let history = memory.sinks.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].itemid, 100);
    assert_eq!(history[0].value.as_deref(), Some("running"));
}

#[tokio::test]
async fn legacy_value_reaches_items_of_any_type() {
    let (memory, dispatcher) = dispatcher(ProgramType::Server);
    let mut item = trapper_item(101, "web01", "agent.ping");
    item.item_type = ItemType::Agent;
    memory.config.add_item(item);

    let answer = raw_request(&dispatcher, b"web01:agent.ping:1").await;
    assert_eq!(answer, b"OK");
    let history = memory.sinks.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].itemid, 101);
}

#[tokio::test]
async fn legacy_active_checks_are_listed_line_by_line() {
    let (memory, dispatcher) = dispatcher(ProgramType::Server);
    memory.config.add_host("web01", 10, None);
    memory.config.set_active_checks(
        "web01",
        vec![ActiveCheck {
            key: "system.cpu.load".into(),
            delay: "30s".into(),
            lastlogsize: 0,
            mtime: 0,
        }],
    );

    let answer = raw_request(&dispatcher, b"ZBX_GET_ACTIVE_CHECKS\nweb01\n").await;
    assert_eq!(answer, b"system.cpu.load:30s:0\nZBX_EOF\n");

    let unknown = raw_request(&dispatcher, b"ZBX_GET_ACTIVE_CHECKS\nghost").await;
    assert_eq!(unknown, b"ZBX_EOF\n");
}

#[tokio::test]
async fn sender_data_reports_counts() {
    let (memory, dispatcher) = dispatcher(ProgramType::Server);
    memory.config.add_host("web01", 10, None);
    memory.config.add_item(trapper_item(100, "web01", "app.status"));

    let envelope = Envelope::request(RequestTag::SenderData).with_field(
        field::DATA,
        json!([
            {"host": "web01", "key": "app.status", "value": "up"},
            {"host": "web01", "key": "missing", "value": "x"}
        ]),
    );
    let answer = request(&dispatcher, envelope).await.expect("reply");
    assert!(answer.is_success());
    let info = answer.info.unwrap();
    assert!(info.starts_with("processed: 1; failed: 1; total: 2"), "{info}");
}

#[tokio::test]
async fn agent_data_for_unknown_host_is_reported_in_info() {
    let (_, dispatcher) = dispatcher(ProgramType::Server);
    let envelope = Envelope::request(RequestTag::AgentData)
        .with_version("7.0.0")
        .with_field(field::HOST, "ghost")
        .with_field(field::DATA, json!([{"itemid": 1, "value": "1", "clock": 1, "ns": 0}]));
    let answer = request(&dispatcher, envelope).await.expect("reply");
    assert!(answer.is_success());
    assert_eq!(answer.info.as_deref(), Some("unknown host 'ghost'"));
}

#[tokio::test]
async fn get_queue_needs_super_admin() {
    let (memory, dispatcher) = dispatcher(ProgramType::Server);
    memory.config.add_user_session("admin-sid", UserRole::Admin);
    memory.config.add_user_session("root-sid", UserRole::SuperAdmin);

    let denied = request(
        &dispatcher,
        Envelope::request(RequestTag::GetQueue).with_field(field::SID, "admin-sid"),
    )
    .await
    .expect("reply");
    assert_eq!(denied.info.as_deref(), Some("Permission denied."));

    let allowed = request(
        &dispatcher,
        Envelope::request(RequestTag::GetQueue).with_field(field::SID, "root-sid"),
    )
    .await
    .expect("reply");
    assert!(allowed.is_success());
    assert!(allowed.field(field::DATA).is_some());
}

#[tokio::test]
async fn server_hands_pending_commands_to_active_proxy() {
    let (memory, dispatcher) = dispatcher(ProgramType::Server);
    memory.config.add_proxy(active_proxy(5, "edge"));
    memory.sinks.queue_command(
        5,
        TaskRecord {
            taskid: 900,
            kind: 2,
            clock: 1_700_000_000,
            ttl: 3600,
            data: json!({"command": "uptime"}),
        },
    );

    let envelope = Envelope::request(RequestTag::ProxyData)
        .with_version("7.0.0")
        .with_field(field::HOST, "edge")
        .with_field(field::SESSION, "0123456789abcdef0123456789abcdef");
    let answer = request(&dispatcher, envelope).await.expect("reply");
    assert!(answer.is_success());
    let tasks = answer.field_array(field::TASKS).expect("tasks piggybacked");
    assert_eq!(tasks.len(), 1);
    assert!(memory.sinks.in_progress(900));
    let runtime = memory.config.runtime_of(5).expect("access recorded");
    assert!(runtime.lastaccess > 0);
}

#[tokio::test]
async fn server_rejects_unknown_proxy() {
    let (_, dispatcher) = dispatcher(ProgramType::Server);
    let envelope = Envelope::request(RequestTag::ProxyData)
        .with_version("7.0.0")
        .with_field(field::HOST, "nobody");
    let answer = request(&dispatcher, envelope).await.expect("reply");
    assert_eq!(answer.info.as_deref(), Some("proxy \"nobody\" not found"));
}

async fn stage_history(memory: &MemoryServices, count: u64) {
    for n in 0..count {
        let record = HistoryRecord {
            itemid: 100 + n,
            clock: 1_700_000_000,
            value: Some(n.to_string()),
            ..HistoryRecord::default()
        };
        memory
            .store
            .append(Record::History(record), 1_700_000_000)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn passive_proxy_commits_only_after_success_ack() {
    let (memory, dispatcher) = dispatcher(ProgramType::ProxyPassive);
    stage_history(&memory, 3).await;
    let cursor = Stream::History.cursor();

    // A failed acknowledgement leaves the cursor where it was.
    let (mut client, handle) = serve(&dispatcher);
    send(&mut client, &Envelope::request(RequestTag::ProxyData)).await;
    let data = reply(&mut client).await.expect("data");
    assert_eq!(data.field_array(field::HISTORY_DATA).map(Vec::len), Some(3));
    assert!(data.field_text(field::SESSION).is_some());
    send(&mut client, &Envelope::failed("busy")).await;
    handle.await.unwrap().unwrap();
    assert_eq!(memory.store.last_id(cursor).await.unwrap(), 0);

    let (mut client, handle) = serve(&dispatcher);
    send(&mut client, &Envelope::request(RequestTag::ProxyData)).await;
    let data = reply(&mut client).await.expect("data");
    let rows = data.field_array(field::HISTORY_DATA).expect("history");
    let last = rows.last().and_then(|row| row[field::ID].as_u64()).unwrap();
    send(&mut client, &Envelope::success()).await;
    handle.await.unwrap().unwrap();
    assert_eq!(memory.store.last_id(cursor).await.unwrap(), last);
}

#[tokio::test]
async fn passive_proxy_refuses_unlisted_server() {
    let memory = MemoryServices::new();
    let ctx = ExchangeContext::new(ProgramType::ProxyPassive, memory.proxy()).with_server_policy(
        crate::context::ServerPolicy {
            servers: vec!["198.51.100.1".into()],
            ..Default::default()
        },
    );
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(ctx)));

    let answer = request(&dispatcher, Envelope::request(RequestTag::ProxyData)).await;
    assert!(answer.is_none());

    let config = Envelope::request(RequestTag::ProxyConfig).with_field(field::DATA, json!({}));
    let answer = request(&dispatcher, config).await.expect("reply");
    assert_eq!(answer.info.as_deref(), Some("connection is not allowed"));
    assert!(memory.config.installed_config().is_none());
}

#[tokio::test]
async fn passive_proxy_installs_configuration() {
    let (memory, dispatcher) = dispatcher(ProgramType::ProxyPassive);
    let config = Envelope::request(RequestTag::ProxyConfig)
        .with_version("7.0.0")
        .with_field(field::DATA, json!({"hosts": []}));
    let answer = request(&dispatcher, config).await.expect("reply");
    assert!(answer.is_success());
    assert_eq!(memory.config.installed_config(), Some(json!({"hosts": []})));
}

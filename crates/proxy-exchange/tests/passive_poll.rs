mod common;

use std::sync::Arc;

use common::*;
use proxy_exchange::clock::unix_now;
use proxy_exchange::collab::ConfigCache;
use proxy_exchange::record::{Stream, TaskRecord};
use proxy_exchange::{
    ExchangeContext, MemoryServices, PassivePoller, PollerConfig, ProgramType, ProxyMode, StagingStore,
};
use proxy_wire::{Compatibility, Version};
use serde_json::json;

struct Server {
    memory: MemoryServices,
    poller: PassivePoller,
}

fn server_polling(proxy: &Node) -> Server {
    let memory = MemoryServices::new();
    memory
        .config
        .add_proxy(proxy_record(ProxyMode::Passive, Some(proxy.addr)));
    let ctx = Arc::new(ExchangeContext::new(ProgramType::Server, memory.server()));
    let poller = PassivePoller::new(ctx, PollerConfig::default());
    Server { memory, poller }
}

#[tokio::test]
async fn empty_proxy_is_reached_without_more_data() {
    let proxy = start_node(ProgramType::ProxyPassive).await;
    let mut server = server_polling(&proxy);

    assert_eq!(server.poller.poll_once(unix_now()).await, 1);
    let runtime = server.memory.config.runtime_of(PROXY_ID).expect("runtime");
    assert!(runtime.lastaccess > 0);
    assert!(!runtime.more);
    assert_eq!(runtime.compatibility, Some(Compatibility::Current));
    assert_eq!(runtime.last_cfg_error_time, 0);
    assert!(server.memory.sinks.history().is_empty());
}

#[tokio::test]
async fn staged_history_is_pulled_and_cursor_advances() {
    let proxy = start_node(ProgramType::ProxyPassive).await;
    stage_history(&proxy.memory, [1, 2, 3]).await;
    let mut server = server_polling(&proxy);
    add_proxy_items(&server.memory, 3);

    server.poller.poll_once(unix_now()).await;
    let history = server.memory.sinks.history();
    assert_eq!(
        history.iter().map(|value| value.itemid).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let store = Arc::clone(&proxy.memory.store);
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move { store.last_id(Stream::History.cursor()).await.unwrap_or(0) == 3 }
        })
        .await
    );
}

#[tokio::test]
async fn commands_are_handed_to_the_proxy() {
    let proxy = start_node(ProgramType::ProxyPassive).await;
    let mut server = server_polling(&proxy);
    server.memory.sinks.queue_command(
        PROXY_ID,
        TaskRecord {
            taskid: 81,
            kind: 2,
            clock: 1_700_000_000,
            ttl: 60,
            data: json!({"command": "df -h"}),
        },
    );

    server.poller.poll_once(unix_now()).await;
    let received = proxy.memory.sinks.received_tasks();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1.taskid, 81);
    assert!(server.memory.sinks.in_progress(81));
}

#[tokio::test]
async fn configuration_is_pushed_on_schedule() {
    let proxy = start_node(ProgramType::ProxyPassive).await;
    let mut server = server_polling(&proxy);
    server.memory.config.set_proxy_config(json!({"hosts": ["db01"]}));

    let now = unix_now();
    server.poller.poll_once(now).await;
    let installed = proxy.memory.config.installed_config().expect("installed");
    assert_eq!(installed["proxyid"], json!(PROXY_ID));

    // Only data and tasks are due one second later.
    server.memory.config.set_proxy_config(json!({"hosts": ["db02"]}));
    server.poller.poll_once(now + 1).await;
    let installed = proxy.memory.config.installed_config().expect("installed");
    assert_eq!(installed["hosts"], json!(["db01"]));

    let schedule = server.poller.schedule(PROXY_ID).expect("schedule");
    assert_eq!(schedule.next_config, now + 10);
    server.poller.poll_once(schedule.next_config).await;
    let installed = proxy.memory.config.installed_config().expect("installed");
    assert_eq!(installed["hosts"], json!(["db02"]));
}

#[tokio::test]
async fn outdated_proxy_still_delivers_data_but_gets_no_configuration() {
    let memory = MemoryServices::new();
    let ctx = Arc::new(
        ExchangeContext::new(ProgramType::ProxyPassive, memory.proxy()).with_version(Version::new(6, 4, 0)),
    );
    let proxy = start_with(memory, ctx).await;
    stage_history(&proxy.memory, [1, 2]).await;
    let mut server = server_polling(&proxy);
    add_proxy_items(&server.memory, 2);
    server.memory.config.set_proxy_config(json!({"hosts": ["db01"]}));

    let now = unix_now();
    server.poller.poll_once(now).await;
    assert_eq!(server.memory.sinks.history().len(), 2);
    let runtime = server.memory.config.runtime_of(PROXY_ID).expect("runtime");
    assert_eq!(runtime.compatibility, Some(Compatibility::Outdated));
    assert_eq!(runtime.version, Some(Version::new(6, 4, 0)));

    server.memory.config.set_proxy_config(json!({"hosts": ["db02"]}));
    server.poller.poll_once(now + 10).await;
    let installed = proxy.memory.config.installed_config().expect("installed");
    assert_eq!(installed["hosts"], json!(["db01"]));
}

#[tokio::test]
async fn proxy_with_configuration_error_is_skipped_until_reload() {
    let proxy = start_node(ProgramType::ProxyPassive).await;
    let mut server = server_polling(&proxy);
    let config = Arc::clone(&server.memory.config);

    let mut runtime = config.proxy_runtime(PROXY_ID).await;
    runtime.last_cfg_error_time = 500;
    config.update_proxy_runtime(PROXY_ID, runtime).await;
    config.set_last_reload(400);

    let now = unix_now();
    assert_eq!(server.poller.poll_once(now).await, 0);
    assert_eq!(config.runtime_of(PROXY_ID).map(|runtime| runtime.lastaccess), Some(0));

    config.set_last_reload(600);
    assert_eq!(server.poller.poll_once(now + 10).await, 1);
    assert!(config.runtime_of(PROXY_ID).map(|runtime| runtime.lastaccess > 0).unwrap_or(false));
}

#[tokio::test]
async fn unusable_address_marks_configuration_error() {
    let memory = MemoryServices::new();
    memory.config.add_proxy(proxy_record(ProxyMode::Passive, None));
    let ctx = Arc::new(ExchangeContext::new(ProgramType::Server, memory.server()));
    let mut poller = PassivePoller::new(ctx, PollerConfig::default());

    let now = unix_now();
    assert_eq!(poller.poll_once(now).await, 1);
    let runtime = memory.config.runtime_of(PROXY_ID).expect("runtime");
    assert_eq!(runtime.last_cfg_error_time, now);
    assert_eq!(runtime.lastaccess, 0);

    assert_eq!(poller.poll_once(now + 10).await, 0);
}

#[tokio::test]
async fn newer_proxy_is_recorded_as_unsupported() {
    let memory = MemoryServices::new();
    let ctx = Arc::new(
        ExchangeContext::new(ProgramType::ProxyPassive, memory.proxy()).with_version(Version::new(8, 0, 0)),
    );
    let proxy = start_with(memory, ctx).await;
    stage_history(&proxy.memory, [1]).await;
    let mut server = server_polling(&proxy);
    add_proxy_items(&server.memory, 1);
    server.memory.config.set_proxy_config(json!({"hosts": ["db01"]}));

    // A stale classification from an earlier exchange keeps configuration
    // back, so the data pull is the first to see the new version.
    let config = Arc::clone(&server.memory.config);
    let mut runtime = config.proxy_runtime(PROXY_ID).await;
    runtime.compatibility = Some(Compatibility::Outdated);
    config.update_proxy_runtime(PROXY_ID, runtime).await;

    server.poller.poll_once(unix_now()).await;
    let runtime = config.runtime_of(PROXY_ID).expect("runtime");
    assert_eq!(runtime.compatibility, Some(Compatibility::Unsupported));
    assert_eq!(runtime.version, Some(Version::new(8, 0, 0)));
    assert!(runtime.lastaccess > 0);
    assert!(server.memory.sinks.history().is_empty());
    assert!(proxy.memory.config.installed_config().is_none());
    assert_eq!(proxy.memory.store.last_id(Stream::History.cursor()).await.unwrap_or(0), 0);
}

//! In-process collaborators. Used by the tests and by single-node deployments
//! that have no external configuration cache or history database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};

use crate::collab::{
    AccessControl, ActiveCheck, AvailabilityManager, AvailabilitySnapshot, CollabResult,
    CollaboratorError, ConfigCache, DiscoverySink, HistorySink, HostLookup, ItemInfo, PeerInfo,
    ProxyMode, ProxyRecord, ProxyRuntime, Services, StagingHistorySink, TaskManager, UserRole,
};
use crate::connection::RedirectDirective;
use crate::record::{
    AutoregRecord, DiscoveryRecord, HistoryRecord, HostActiveStatus, InterfaceAvailability,
    TaskRecord,
};
use crate::store::MemoryStore;

#[derive(Default)]
struct ConfigState {
    items: BTreeMap<u64, ItemInfo>,
    hosts: HashMap<String, u64>,
    host_proxy: HashMap<u64, u64>,
    redirects: HashMap<String, RedirectDirective>,
    proxies: BTreeMap<u64, ProxyRecord>,
    runtime: HashMap<u64, ProxyRuntime>,
    last_reload: i64,
    proxy_config: Value,
    installed_config: Option<Value>,
    active_checks: HashMap<String, Vec<ActiveCheck>>,
    user_sessions: HashMap<String, UserRole>,
}

/// Configuration cache and user session store kept in memory.
#[derive(Default)]
pub struct MemoryConfigCache {
    state: RwLock<ConfigState>,
}

impl MemoryConfigCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a host and, through `proxyid`, who monitors it.
    pub fn add_host(&self, name: &str, hostid: u64, proxyid: Option<u64>) {
        let mut state = self.state.write();
        state.hosts.insert(name.to_string(), hostid);
        match proxyid {
            Some(proxyid) => state.host_proxy.insert(hostid, proxyid),
            None => state.host_proxy.remove(&hostid),
        };
    }

    pub fn add_item(&self, item: ItemInfo) {
        let mut state = self.state.write();
        state.hosts.entry(item.host.clone()).or_insert(item.hostid);
        if let Some(proxyid) = item.proxyid {
            state.host_proxy.insert(item.hostid, proxyid);
        }
        state.items.insert(item.itemid, item);
    }

    /// Answers lookups of `host` with a redirect instead of a host id.
    pub fn add_redirect(&self, host: &str, directive: RedirectDirective) {
        self.state.write().redirects.insert(host.to_string(), directive);
    }

    pub fn add_proxy(&self, proxy: ProxyRecord) {
        self.state.write().proxies.insert(proxy.proxyid, proxy);
    }

    pub fn set_proxy_config(&self, config: Value) {
        self.state.write().proxy_config = config;
    }

    pub fn set_active_checks(&self, host: &str, checks: Vec<ActiveCheck>) {
        self.state.write().active_checks.insert(host.to_string(), checks);
    }

    pub fn add_user_session(&self, sid: &str, role: UserRole) {
        self.state.write().user_sessions.insert(sid.to_string(), role);
    }

    pub fn set_last_reload(&self, at: i64) {
        self.state.write().last_reload = at;
    }

    pub fn installed_config(&self) -> Option<Value> {
        self.state.read().installed_config.clone()
    }

    pub fn runtime_of(&self, proxyid: u64) -> Option<ProxyRuntime> {
        self.state.read().runtime.get(&proxyid).cloned()
    }
}

#[async_trait]
impl ConfigCache for MemoryConfigCache {
    async fn item_by_id(&self, itemid: u64) -> Option<ItemInfo> {
        self.state.read().items.get(&itemid).cloned()
    }

    async fn item_by_key(&self, host: &str, key: &str) -> Option<ItemInfo> {
        self.state
            .read()
            .items
            .values()
            .find(|item| item.host == host && item.key == key)
            .cloned()
    }

    async fn host_by_name(&self, host: &str, _peer: &PeerInfo) -> HostLookup {
        let state = self.state.read();
        if let Some(directive) = state.redirects.get(host) {
            return HostLookup::Redirect(directive.clone());
        }
        match state.hosts.get(host) {
            Some(hostid) => HostLookup::Found(*hostid),
            None => HostLookup::Unknown,
        }
    }

    async fn host_proxy(&self, hostid: u64) -> Option<u64> {
        self.state.read().host_proxy.get(&hostid).copied()
    }

    async fn proxy_by_name(&self, name: &str) -> Option<ProxyRecord> {
        self.state
            .read()
            .proxies
            .values()
            .find(|proxy| proxy.name == name)
            .cloned()
    }

    async fn passive_proxies(&self) -> Vec<ProxyRecord> {
        self.state
            .read()
            .proxies
            .values()
            .filter(|proxy| proxy.mode == ProxyMode::Passive)
            .cloned()
            .collect()
    }

    async fn hosts_of_proxy(&self, proxyid: u64) -> Vec<u64> {
        let mut hosts: Vec<u64> = self
            .state
            .read()
            .host_proxy
            .iter()
            .filter(|(_, owner)| **owner == proxyid)
            .map(|(hostid, _)| *hostid)
            .collect();
        hosts.sort_unstable();
        hosts
    }

    async fn proxy_runtime(&self, proxyid: u64) -> ProxyRuntime {
        self.state
            .read()
            .runtime
            .get(&proxyid)
            .cloned()
            .unwrap_or_default()
    }

    async fn update_proxy_runtime(&self, proxyid: u64, runtime: ProxyRuntime) {
        self.state.write().runtime.insert(proxyid, runtime);
    }

    async fn last_reload(&self) -> i64 {
        self.state.read().last_reload
    }

    async fn proxy_config(&self, proxy: &ProxyRecord) -> CollabResult<Value> {
        let state = self.state.read();
        let mut config = match &state.proxy_config {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        config.insert("proxyid".to_string(), Value::from(proxy.proxyid));
        Ok(Value::Object(config))
    }

    async fn install_proxy_config(&self, config: Value) -> CollabResult<()> {
        if !config.is_object() {
            return Err(CollaboratorError::Failed(
                "configuration data is not an object".to_string(),
            ));
        }
        let mut state = self.state.write();
        state.installed_config = Some(config);
        state.last_reload = crate::clock::unix_now();
        Ok(())
    }

    async fn active_checks(&self, host: &str) -> CollabResult<Vec<ActiveCheck>> {
        let state = self.state.read();
        if !state.hosts.contains_key(host) {
            return Err(CollaboratorError::Failed(format!(
                "host [{host}] not found"
            )));
        }
        Ok(state.active_checks.get(host).cloned().unwrap_or_default())
    }

    async fn queue_overview(&self) -> Value {
        let state = self.state.read();
        let proxies: Vec<Value> = state
            .proxies
            .values()
            .map(|proxy| {
                let lastaccess = state
                    .runtime
                    .get(&proxy.proxyid)
                    .map(|runtime| runtime.lastaccess)
                    .unwrap_or(0);
                json!({"proxyid": proxy.proxyid, "name": proxy.name, "lastaccess": lastaccess})
            })
            .collect();
        json!({"items": state.items.len(), "proxies": proxies})
    }
}

#[async_trait]
impl AccessControl for MemoryConfigCache {
    async fn session_role(&self, sid: &str) -> Option<UserRole> {
        self.state.read().user_sessions.get(sid).copied()
    }
}

#[derive(Default)]
struct SinkState {
    history: Vec<HistoryRecord>,
    history_failure: Option<String>,
    discovered: Vec<(Option<u64>, DiscoveryRecord)>,
    autoregistered: Vec<(Option<u64>, AutoregRecord)>,
    interfaces: Vec<InterfaceAvailability>,
    active_status: Vec<HostActiveStatus>,
    heartbeats: Vec<(u64, i64)>,
    pending_revision: u64,
    pending_interfaces: Vec<(u64, InterfaceAvailability)>,
    pending_hosts: Vec<(u64, HostActiveStatus)>,
    commands: HashMap<u64, Vec<TaskRecord>>,
    in_progress: HashSet<u64>,
    received_tasks: Vec<(Option<u64>, TaskRecord)>,
    task_failure: Option<String>,
    scripts: HashMap<u64, String>,
}

/// History cache, discovery, availability and task manager in one place.
#[derive(Default)]
pub struct MemorySinks {
    state: Mutex<SinkState>,
}

impl MemorySinks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.state.lock().history.clone()
    }

    /// Makes the next history deliveries fail with `reason`; `None` heals.
    pub fn fail_history(&self, reason: Option<&str>) {
        self.state.lock().history_failure = reason.map(str::to_string);
    }

    /// Makes the next saves of received tasks fail with `reason`; `None` heals.
    pub fn fail_task_saves(&self, reason: Option<&str>) {
        self.state.lock().task_failure = reason.map(str::to_string);
    }

    pub fn discovered(&self) -> Vec<(Option<u64>, DiscoveryRecord)> {
        self.state.lock().discovered.clone()
    }

    pub fn autoregistered(&self) -> Vec<(Option<u64>, AutoregRecord)> {
        self.state.lock().autoregistered.clone()
    }

    pub fn interfaces(&self) -> Vec<InterfaceAvailability> {
        self.state.lock().interfaces.clone()
    }

    pub fn active_status(&self) -> Vec<HostActiveStatus> {
        self.state.lock().active_status.clone()
    }

    pub fn heartbeats(&self) -> Vec<(u64, i64)> {
        self.state.lock().heartbeats.clone()
    }

    pub fn received_tasks(&self) -> Vec<(Option<u64>, TaskRecord)> {
        self.state.lock().received_tasks.clone()
    }

    pub fn in_progress(&self, taskid: u64) -> bool {
        self.state.lock().in_progress.contains(&taskid)
    }

    /// Queues an availability change for upstream delivery.
    pub fn record_interface(&self, record: InterfaceAvailability) {
        let mut state = self.state.lock();
        state.pending_revision += 1;
        let revision = state.pending_revision;
        state.pending_interfaces.push((revision, record));
    }

    pub fn record_host_status(&self, record: HostActiveStatus) {
        let mut state = self.state.lock();
        state.pending_revision += 1;
        let revision = state.pending_revision;
        state.pending_hosts.push((revision, record));
    }

    /// Queues a remote command for `proxyid`.
    pub fn queue_command(&self, proxyid: u64, task: TaskRecord) {
        self.state.lock().commands.entry(proxyid).or_default().push(task);
    }

    pub fn add_script(&self, scriptid: u64, output: &str) {
        self.state.lock().scripts.insert(scriptid, output.to_string());
    }
}

#[async_trait]
impl HistorySink for MemorySinks {
    async fn accept(&self, values: Vec<HistoryRecord>) -> CollabResult<()> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.history_failure {
            return Err(CollaboratorError::Failed(reason.clone()));
        }
        state.history.extend(values);
        Ok(())
    }
}

#[async_trait]
impl DiscoverySink for MemorySinks {
    async fn discovered(&self, proxyid: Option<u64>, records: Vec<DiscoveryRecord>) -> CollabResult<()> {
        self.state
            .lock()
            .discovered
            .extend(records.into_iter().map(|record| (proxyid, record)));
        Ok(())
    }

    async fn autoregistered(&self, proxyid: Option<u64>, records: Vec<AutoregRecord>) -> CollabResult<()> {
        self.state
            .lock()
            .autoregistered
            .extend(records.into_iter().map(|record| (proxyid, record)));
        Ok(())
    }
}

#[async_trait]
impl AvailabilityManager for MemorySinks {
    async fn apply_interfaces(&self, records: Vec<InterfaceAvailability>) -> CollabResult<()> {
        self.state.lock().interfaces.extend(records);
        Ok(())
    }

    async fn apply_active_status(&self, records: Vec<HostActiveStatus>) -> CollabResult<()> {
        self.state.lock().active_status.extend(records);
        Ok(())
    }

    async fn active_heartbeat(&self, hostid: u64, frequency: i64) -> CollabResult<()> {
        self.state.lock().heartbeats.push((hostid, frequency));
        Ok(())
    }

    async fn pending(&self) -> AvailabilitySnapshot {
        let state = self.state.lock();
        AvailabilitySnapshot {
            revision: state.pending_revision,
            interfaces: state
                .pending_interfaces
                .iter()
                .map(|(_, record)| record.clone())
                .collect(),
            hosts: state
                .pending_hosts
                .iter()
                .map(|(_, record)| record.clone())
                .collect(),
        }
    }

    async fn acknowledge(&self, revision: u64) {
        let mut state = self.state.lock();
        state.pending_interfaces.retain(|(at, _)| *at > revision);
        state.pending_hosts.retain(|(at, _)| *at > revision);
    }
}

#[async_trait]
impl TaskManager for MemorySinks {
    async fn pending_for_proxy(&self, proxyid: u64) -> CollabResult<Vec<TaskRecord>> {
        let state = self.state.lock();
        Ok(state
            .commands
            .get(&proxyid)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|task| !state.in_progress.contains(&task.taskid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_in_progress(&self, taskids: &[u64]) -> CollabResult<()> {
        self.state.lock().in_progress.extend(taskids.iter().copied());
        Ok(())
    }

    async fn save_received(&self, proxyid: Option<u64>, tasks: Vec<TaskRecord>) -> CollabResult<()> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.task_failure {
            return Err(CollaboratorError::Failed(reason.clone()));
        }
        state
            .received_tasks
            .extend(tasks.into_iter().map(|task| (proxyid, task)));
        Ok(())
    }

    async fn run_command(&self, request: &Map<String, Value>) -> CollabResult<String> {
        let scriptid = request
            .get("scriptid")
            .and_then(proxy_wire::json::as_u64)
            .ok_or_else(|| CollaboratorError::Failed("Invalid script identifier.".to_string()))?;
        self.state
            .lock()
            .scripts
            .get(&scriptid)
            .cloned()
            .ok_or_else(|| CollaboratorError::Failed("Unknown script identifier.".to_string()))
    }
}

/// The in-memory collaborators wired together.
#[derive(Clone)]
pub struct MemoryServices {
    pub store: Arc<MemoryStore>,
    pub config: Arc<MemoryConfigCache>,
    pub sinks: Arc<MemorySinks>,
    pub staging_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryServices {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            config: MemoryConfigCache::new(),
            sinks: MemorySinks::new(),
            staging_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Collaborators for a server: history goes straight to the history cache.
    pub fn server(&self) -> Services {
        self.services(self.sinks.clone())
    }

    /// Collaborators for a proxy: history is buffered for upstream delivery.
    pub fn proxy(&self) -> Services {
        self.services(Arc::new(StagingHistorySink::new(
            self.store.clone(),
            self.staging_lock.clone(),
        )))
    }

    fn services(&self, history: Arc<dyn HistorySink>) -> Services {
        Services {
            store: self.store.clone(),
            config: self.config.clone(),
            history,
            discovery: self.sinks.clone(),
            availability: self.sinks.clone(),
            tasks: self.sinks.clone(),
            access: self.config.clone(),
            staging_lock: self.staging_lock.clone(),
        }
    }
}

impl Default for MemoryServices {
    fn default() -> Self {
        Self::new()
    }
}

//! The two long-running exchange loops: a server polling its passive proxies
//! and an active proxy pushing to its server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use proxy_wire::tags::field;
use proxy_wire::{
    classify_compatibility, Compatibility, Envelope, EnvelopeError, MoreFlag, RemoteVersion, RequestTag,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::{assemble, BatchContents};
use crate::clock::{timespec_now, unix_now};
use crate::collab::ProxyRecord;
use crate::connection::{exchange, exchange_open, AddressCandidate, AddressList};
use crate::context::{require_supported, ExchangeContext, LEGACY_PROXY_VERSION};
use crate::error::{ErrorKind, ExchangeError, ExchangeResult};
use crate::ingest::{parse_array, process_proxy_data, IngestCounts};
use crate::record::TaskRecord;

/// How often a server exchanges each kind of data with a passive proxy.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub config_frequency: Duration,
    pub data_frequency: Duration,
    pub tasks_frequency: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            config_frequency: Duration::from_secs(10),
            data_frequency: Duration::from_secs(1),
            tasks_frequency: Duration::from_secs(1),
        }
    }
}

/// Next-check timestamps of one passive proxy, in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxySchedule {
    pub next_config: i64,
    pub next_data: i64,
    pub next_tasks: i64,
}

impl ProxySchedule {
    fn due_at(now: i64) -> Self {
        Self {
            next_config: now,
            next_data: now,
            next_tasks: now,
        }
    }

    fn earliest(&self) -> i64 {
        self.next_config.min(self.next_data).min(self.next_tasks)
    }

    fn due(&self, now: i64) -> Due {
        Due {
            config: self.next_config <= now,
            data: self.next_data <= now,
            tasks: self.next_tasks <= now,
        }
    }

    fn advance(&mut self, due: Due, now: i64, config: &PollerConfig) {
        if due.config {
            self.next_config = now + seconds(config.config_frequency);
        }
        if due.data {
            self.next_data = now + seconds(config.data_frequency);
        }
        if due.tasks {
            self.next_tasks = now + seconds(config.tasks_frequency);
        }
    }
}

fn seconds(duration: Duration) -> i64 {
    duration.as_secs().max(1) as i64
}

#[derive(Debug, Clone, Copy)]
struct Due {
    config: bool,
    data: bool,
    tasks: bool,
}

impl Due {
    fn any(&self) -> bool {
        self.config || self.data || self.tasks
    }
}

/// What one poll learned about the proxy, kept even when a later step failed.
#[derive(Debug, Default)]
struct PollReport {
    reached: bool,
    compressed: bool,
    version: Option<(RemoteVersion, Compatibility)>,
}

/// Server side of passive proxy communication.
pub struct PassivePoller {
    ctx: Arc<ExchangeContext>,
    config: PollerConfig,
    schedules: HashMap<u64, ProxySchedule>,
}

impl PassivePoller {
    pub fn new(ctx: Arc<ExchangeContext>, config: PollerConfig) -> Self {
        Self {
            ctx,
            config,
            schedules: HashMap::new(),
        }
    }

    pub fn schedule(&self, proxyid: u64) -> Option<ProxySchedule> {
        self.schedules.get(&proxyid).copied()
    }

    /// Earliest next-check across every known proxy.
    pub fn next_check(&self) -> Option<i64> {
        self.schedules.values().map(ProxySchedule::earliest).min()
    }

    /// Polls every proxy with something due at `now`. Returns how many were polled.
    pub async fn poll_once(&mut self, now: i64) -> usize {
        let proxies = self.ctx.services.config.passive_proxies().await;
        self.schedules
            .retain(|proxyid, _| proxies.iter().any(|proxy| proxy.proxyid == *proxyid));

        let mut polled = 0;
        for proxy in proxies {
            let schedule = *self
                .schedules
                .entry(proxy.proxyid)
                .or_insert_with(|| ProxySchedule::due_at(now));
            let due = schedule.due(now);
            if !due.any() {
                continue;
            }

            if self.misconfigured(&proxy).await {
                debug!(proxy = %proxy.name, "skipping proxy with configuration error until next reload");
            } else {
                polled += 1;
                self.poll_proxy(&proxy, due, now).await;
            }
            if let Some(schedule) = self.schedules.get_mut(&proxy.proxyid) {
                schedule.advance(due, now, &self.config);
            }
        }
        polled
    }

    async fn misconfigured(&self, proxy: &ProxyRecord) -> bool {
        let config = &self.ctx.services.config;
        let runtime = config.proxy_runtime(proxy.proxyid).await;
        runtime.last_cfg_error_time != 0 && runtime.last_cfg_error_time >= config.last_reload().await
    }

    async fn poll_proxy(&self, proxy: &ProxyRecord, due: Due, now: i64) {
        let ctx = &self.ctx;
        let mut report = PollReport::default();

        let result = match proxy_address(proxy) {
            Ok(mut addresses) => self.run_exchanges(proxy, &mut addresses, due, &mut report).await,
            Err(err) => Err(err),
        };

        if report.reached {
            ctx.record_proxy_access(proxy, report.version, report.compressed).await;
        }
        if let Err(err) = result {
            counter!("proxy_exchange_failures_total", 1, "kind" => err.kind().as_str());
            warn!("cannot communicate with proxy \"{}\" at \"{}\": {err}", proxy.name, proxy.address);
            if err.kind() == ErrorKind::ConfigError {
                let mut runtime = ctx.services.config.proxy_runtime(proxy.proxyid).await;
                runtime.last_cfg_error_time = now;
                ctx.services.config.update_proxy_runtime(proxy.proxyid, runtime).await;
            }
        }
    }

    async fn run_exchanges(
        &self,
        proxy: &ProxyRecord,
        addresses: &mut AddressList,
        due: Due,
        report: &mut PollReport,
    ) -> ExchangeResult<()> {
        if due.config {
            self.push_config(proxy, addresses, report).await?;
        }
        if due.data {
            self.pull_data(proxy, addresses, report).await?;
        }
        if due.tasks {
            self.pull_tasks(proxy, addresses, report).await?;
        }
        Ok(())
    }

    async fn push_config(
        &self,
        proxy: &ProxyRecord,
        addresses: &mut AddressList,
        report: &mut PollReport,
    ) -> ExchangeResult<()> {
        let ctx = &self.ctx;
        let runtime = ctx.services.config.proxy_runtime(proxy.proxyid).await;
        if matches!(runtime.compatibility, Some(compatibility) if compatibility != Compatibility::Current) {
            debug!(proxy = %proxy.name, "not sending configuration to a proxy of another version");
            return Ok(());
        }

        let config = ctx.services.config.proxy_config(proxy).await?;
        let request = Envelope::request(RequestTag::ProxyConfig)
            .with_version(ctx.version)
            .with_field(field::DATA, config);
        let mut exchange_config = ctx.config.clone();
        exchange_config.compress = proxy_wire::compression_available();

        let reply = exchange(addresses, &request, &exchange_config, true)
            .await?
            .ok_or_else(|| ExchangeError::Protocol("no reply received".to_string()))?;
        report.reached = true;
        report.compressed = reply.compressed;
        if let Some(version) = reply.envelope.version.as_deref() {
            let classified = ctx.classify_proxy_version(&proxy.name, Some(version));
            report.version = Some(classified);
            require_supported(classified)?;
        }
        if !reply.envelope.is_success() {
            return Err(ExchangeError::Rejected {
                info: reply.envelope.info.unwrap_or_default(),
            });
        }
        debug!(proxy = %proxy.name, "configuration sent");
        Ok(())
    }

    /// Pulls `proxy data` until the proxy stops reporting more, bounded by
    /// the exchange timeout.
    async fn pull_data(
        &self,
        proxy: &ProxyRecord,
        addresses: &mut AddressList,
        report: &mut PollReport,
    ) -> ExchangeResult<()> {
        let ctx = &self.ctx;
        let started = Instant::now();
        let request = Envelope::request(RequestTag::ProxyData).with_version(ctx.version);
        let mut first = true;

        loop {
            let open = match exchange_open(addresses, &request, &ctx.config).await {
                Ok(open) => open,
                Err(ExchangeError::Envelope(EnvelopeError::Empty)) if first => {
                    // Proxies without batched data answer with nothing at all.
                    let legacy = RemoteVersion::Known(LEGACY_PROXY_VERSION);
                    report.reached = true;
                    report.version = Some((legacy, classify_compatibility(ctx.version, legacy.packed())));
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            first = false;
            report.reached = true;
            report.compressed = open.reply.compressed;

            let envelope = &open.reply.envelope;
            let classified = ctx.classify_proxy_version(&proxy.name, envelope.version.as_deref());
            report.version = Some(classified);
            if let Err(err) = require_supported(classified) {
                open.acknowledge(&Envelope::failed(err.to_string()).with_version(ctx.version))
                    .await?;
                return Err(err);
            }

            let outcome = process_proxy_data(ctx, proxy, envelope, timespec_now()).await;
            let ack = outcome.response().with_version(ctx.version);
            open.acknowledge(&ack).await?;
            if let Some(error) = outcome.error {
                return Err(ExchangeError::Protocol(error));
            }

            let mut runtime = ctx.services.config.proxy_runtime(proxy.proxyid).await;
            runtime.more = outcome.more == MoreFlag::More;
            runtime.proxy_delay = outcome.proxy_delay;
            let more = runtime.more;
            ctx.services.config.update_proxy_runtime(proxy.proxyid, runtime).await;
            debug!(proxy = %proxy.name, more = more, "{}", outcome.info);

            if outcome.more != MoreFlag::More || started.elapsed() >= ctx.config.timeout {
                return Ok(());
            }
        }
    }

    /// Hands pending remote commands to the proxy and collects their results.
    async fn pull_tasks(
        &self,
        proxy: &ProxyRecord,
        addresses: &mut AddressList,
        report: &mut PollReport,
    ) -> ExchangeResult<()> {
        let ctx = &self.ctx;
        let tasks = ctx.services.tasks.pending_for_proxy(proxy.proxyid).await?;
        let mut request = Envelope::request(RequestTag::ProxyTasks).with_version(ctx.version);
        if !tasks.is_empty() {
            let value = serde_json::to_value(&tasks).map_err(|err| ExchangeError::Protocol(err.to_string()))?;
            request.set_field(field::TASKS, value);
        }

        let open = exchange_open(addresses, &request, &ctx.config).await?;
        report.reached = true;
        report.compressed = open.reply.compressed;

        let envelope = &open.reply.envelope;
        if !envelope.is_success() {
            let info = envelope.info.clone().unwrap_or_default();
            open.acknowledge(&Envelope::failed(info.clone())).await?;
            return Err(ExchangeError::Rejected { info });
        }
        let handed_over: Vec<u64> = tasks.iter().map(|task| task.taskid).collect();
        if !handed_over.is_empty() {
            ctx.services.tasks.mark_in_progress(&handed_over).await?;
        }

        let results: Vec<TaskRecord> = envelope
            .field_array(field::TASKS)
            .map(|rows| parse_array(rows, &mut IngestCounts::new()))
            .unwrap_or_default();
        let saved = if results.is_empty() {
            Ok(())
        } else {
            ctx.services.tasks.save_received(Some(proxy.proxyid), results).await
        };
        let ack = match &saved {
            Ok(()) => Envelope::success().with_version(ctx.version),
            Err(err) => Envelope::failed(err.to_string()).with_version(ctx.version),
        };
        open.acknowledge(&ack).await?;
        saved.map_err(Into::into)
    }

    /// Polls forever, sleeping until the next proxy is due.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("passive proxy poller started");
            loop {
                let now = unix_now();
                let polled = self.poll_once(now).await;
                if polled > 0 {
                    debug!(polled, "polled passive proxies");
                }
                let wait = match self.next_check() {
                    Some(next) => (next - unix_now()).clamp(0, 1),
                    None => 1,
                };
                tokio::time::sleep(Duration::from_secs(wait as u64).max(Duration::from_millis(100))).await;
            }
        })
    }
}

fn proxy_address(proxy: &ProxyRecord) -> ExchangeResult<AddressList> {
    let host = proxy.address.trim();
    if host.is_empty() || proxy.port == 0 {
        return Err(ExchangeError::Config(format!(
            "invalid address \"{}:{}\" of proxy \"{}\"",
            host, proxy.port, proxy.name
        )));
    }
    Ok(AddressList::new(AddressCandidate::new(host, proxy.port)))
}

/// How often an active proxy talks to its server.
#[derive(Debug, Clone)]
pub struct PusherConfig {
    pub data_frequency: Duration,
    pub config_frequency: Duration,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            data_frequency: Duration::from_secs(1),
            config_frequency: Duration::from_secs(10),
        }
    }
}

/// Active proxy side: pushes staged data and pulls configuration.
///
/// The address list lives as long as the pusher, so a redirect learned in
/// one exchange is the first address tried in the next.
pub struct ActivePusher {
    ctx: Arc<ExchangeContext>,
    addresses: AddressList,
    config: PusherConfig,
}

impl ActivePusher {
    pub fn new(ctx: Arc<ExchangeContext>, addresses: AddressList, config: PusherConfig) -> Self {
        Self {
            ctx,
            addresses,
            config,
        }
    }

    pub fn addresses(&self) -> &AddressList {
        &self.addresses
    }

    /// Sends one `proxy data` batch. Cursors advance only on a SUCCESS reply;
    /// any failure leaves the staged data to be resent unchanged.
    pub async fn push_once(&mut self) -> ExchangeResult<MoreFlag> {
        let ctx = &self.ctx;
        let (request, pending) = {
            let _guard = ctx.services.staging_lock.lock().await;
            let now = timespec_now();
            let mut request = Envelope::request(RequestTag::ProxyData)
                .with_field(field::HOST, ctx.hostname.clone())
                .with_field(field::SESSION, ctx.session_token.clone())
                .with_version(ctx.version)
                .with_clock(now.sec, now.ns);
            let pending = assemble(&ctx.services, &ctx.config.limits, BatchContents::PROXY_DATA, &mut request).await?;
            (request, pending)
        };

        let reply = match exchange(&mut self.addresses, &request, &ctx.config, true).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return Err(ExchangeError::Protocol("no reply received".to_string())),
            Err(err) => return Err(err),
        };
        if !reply.envelope.is_success() {
            return Err(ExchangeError::Rejected {
                info: reply.envelope.info.unwrap_or_default(),
            });
        }

        let more = pending.more;
        let received: Vec<TaskRecord> = reply
            .envelope
            .field_array(field::TASKS)
            .map(|rows| parse_array(rows, &mut IngestCounts::new()))
            .unwrap_or_default();
        pending.with_received(received).commit(&ctx.services).await?;
        if let Some(info) = reply.envelope.info.as_deref() {
            debug!(server = %reply.address, "{info}");
        }
        Ok(more)
    }

    /// Requests configuration from the server and installs it.
    pub async fn pull_config(&mut self) -> ExchangeResult<()> {
        let ctx = &self.ctx;
        let request = Envelope::request(RequestTag::ProxyConfig)
            .with_field(field::HOST, ctx.hostname.clone())
            .with_version(ctx.version);
        let mut config = ctx.config.clone();
        config.limits.max_recv_size = config.limits.max_large_recv_size.max(config.limits.max_recv_size);

        let reply = exchange(&mut self.addresses, &request, &config, true)
            .await?
            .ok_or_else(|| ExchangeError::Protocol("no reply received".to_string()))?;
        let mut envelope = reply.envelope;
        if !envelope.is_success() {
            return Err(ExchangeError::Rejected {
                info: envelope.info.unwrap_or_default(),
            });
        }
        let data = envelope
            .take_field(field::DATA)
            .ok_or(ExchangeError::Envelope(EnvelopeError::MissingTag(field::DATA)))?;
        ctx.services.config.install_proxy_config(data).await?;
        info!(server = %reply.address, "received configuration data from server");
        Ok(())
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(first = %self.addresses.first(), "active proxy data sender started");
            let mut next_config = Instant::now();
            loop {
                if Instant::now() >= next_config {
                    if let Err(err) = self.pull_config().await {
                        warn!("cannot obtain configuration data from server at \"{}\": {err}", self.addresses.first());
                    }
                    next_config = Instant::now() + self.config.config_frequency;
                }

                let more = match self.push_once().await {
                    Ok(more) => more,
                    Err(err) => {
                        counter!("proxy_exchange_failures_total", 1, "kind" => err.kind().as_str());
                        warn!("cannot send proxy data to server at \"{}\": {err}", self.addresses.first());
                        MoreFlag::Done
                    }
                };
                if more != MoreFlag::More {
                    tokio::time::sleep(self.config.data_frequency).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_advances_only_due_checks() {
        let config = PollerConfig {
            config_frequency: Duration::from_secs(60),
            data_frequency: Duration::from_secs(5),
            tasks_frequency: Duration::from_secs(5),
        };
        let mut schedule = ProxySchedule::due_at(100);
        let due = schedule.due(100);
        assert!(due.config && due.data && due.tasks);
        schedule.advance(due, 100, &config);
        assert_eq!(schedule.next_config, 160);
        assert_eq!(schedule.next_data, 105);
        assert_eq!(schedule.earliest(), 105);

        let due = schedule.due(105);
        assert!(!due.config && due.data && due.tasks);
        schedule.advance(due, 105, &config);
        assert_eq!(schedule.next_config, 160);
        assert_eq!(schedule.next_data, 110);
        assert!(!schedule.due(109).any());
    }

    #[test]
    fn proxy_without_address_is_a_configuration_error() {
        let proxy = ProxyRecord {
            proxyid: 1,
            name: "edge".into(),
            mode: crate::collab::ProxyMode::Passive,
            address: " ".into(),
            port: 10051,
            allowed_addresses: Vec::new(),
            tls_accept: Default::default(),
            tls_issuer: None,
            tls_subject: None,
            psk_identity: None,
        };
        let err = proxy_address(&proxy).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }
}

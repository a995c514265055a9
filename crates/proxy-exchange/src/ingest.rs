//! Receiver side of the transfer: turns incoming arrays into validated
//! records, drops replays through the session watermark and hands the rest to
//! the collaborators.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use metrics::counter;
use proxy_wire::tags::field;
use proxy_wire::{json, Envelope, MoreFlag};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::clock::Timespec;
use crate::collab::{ItemInfo, ItemType, PeerInfo, ProxyRecord};
use crate::context::ExchangeContext;
use crate::record::{
    AutoregRecord, DiscoveryRecord, HistoryRecord, HostActiveStatus, InterfaceAvailability, ItemState,
    TaskRecord,
};
use crate::session::{SessionHandle, SessionType, SESSION_TOKEN_LEN};

const MAX_CLOCK: i64 = i32::MAX as i64;
const MAX_NS: i64 = 999_999_999;

/// Tally of one ingest call.
#[derive(Debug, Clone)]
pub struct IngestCounts {
    pub processed: usize,
    pub failed: usize,
    /// Replays dropped by the session watermark.
    pub skipped: usize,
    pub total: usize,
    started: Instant,
}

impl Default for IngestCounts {
    fn default() -> Self {
        Self {
            processed: 0,
            failed: 0,
            skipped: 0,
            total: 0,
            started: Instant::now(),
        }
    }
}

impl IngestCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// The diagnostic string peers and tooling parse.
    pub fn info(&self) -> String {
        format!(
            "processed: {}; failed: {}; total: {}; seconds spent: {:.6}",
            self.processed,
            self.failed,
            self.total,
            self.started.elapsed().as_secs_f64()
        )
    }

    fn report(&self, source: &'static str) {
        counter!("proxy_exchange_records_total", self.processed as u64, "source" => source, "outcome" => "processed");
        counter!("proxy_exchange_records_total", self.failed as u64, "source" => source, "outcome" => "failed");
        counter!("proxy_exchange_records_total", self.skipped as u64, "source" => source, "outcome" => "skipped");
    }
}

impl fmt::Display for IngestCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info())
    }
}

/// Permission and type check applied to each resolved item.
#[derive(Debug, Clone, Copy)]
pub enum Validator<'a> {
    /// Values relayed by a proxy must belong to hosts it monitors.
    Proxy { proxyid: u64 },
    /// Active agents only submit values for their own active checks.
    Agent,
    /// Trappers, restricted by each item's allowed hosts.
    Sender { peer: &'a PeerInfo },
    /// Bare `host:key:value` lines; any item resolved by key is accepted.
    Legacy,
}

impl Validator<'_> {
    pub fn validate(&self, item: &ItemInfo) -> Result<(), String> {
        match self {
            Validator::Proxy { proxyid } => {
                if item.proxyid != Some(*proxyid) {
                    return Err(format!(
                        "cannot process item \"{}\" on host \"{}\": host is not monitored by the proxy",
                        item.key, item.host
                    ));
                }
                if matches!(item.item_type, ItemType::Calculated | ItemType::Internal) {
                    return Err(format!(
                        "cannot process item \"{}\" on host \"{}\": item type cannot be collected by a proxy",
                        item.key, item.host
                    ));
                }
                Ok(())
            }
            Validator::Agent => {
                if item.proxyid.is_some() {
                    return Err(format!(
                        "cannot process item \"{}\": host is monitored by a proxy",
                        item.key
                    ));
                }
                if item.item_type != ItemType::AgentActive {
                    return Err(format!(
                        "cannot process item \"{}\": not an active agent item",
                        item.key
                    ));
                }
                Ok(())
            }
            Validator::Sender { peer } => {
                if item.proxyid.is_some() {
                    return Err(format!(
                        "cannot process item \"{}\" trap: host is monitored by a proxy or proxy group",
                        item.key
                    ));
                }
                if item.item_type != ItemType::Trapper {
                    return Err(format!(
                        "cannot process item \"{}\" trap: item type \"{:?}\" cannot be used with traps",
                        item.key, item.item_type
                    ));
                }
                if !item.trapper_hosts.is_empty() && !peer.matches_any(&item.trapper_hosts) {
                    return Err(format!(
                        "cannot process item \"{}\" trap: connection from \"{}\" rejected, allowed hosts: \"{}\"",
                        item.key,
                        peer.address,
                        item.trapper_hosts.join(",")
                    ));
                }
                Ok(())
            }
            Validator::Legacy => Ok(()),
        }
    }
}

/// One history row before its item is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub id: u64,
    pub itemid: Option<u64>,
    pub host: Option<String>,
    pub key: Option<String>,
    pub record: HistoryRecord,
}

/// Parses a history row. Rows with `clock` but no `ns` get nanoseconds from
/// `shift` so values sharing a second stay distinct; rows without `clock`
/// take the time the request arrived.
pub fn parse_row(value: &Value, received: Timespec, shift: &mut Timespec) -> Result<ParsedRow, String> {
    let row = value
        .as_object()
        .ok_or_else(|| "history row is not an object".to_string())?;

    let (clock, ns) = match row.get(field::CLOCK) {
        Some(raw) => {
            let clock = json::as_i64(raw)
                .filter(|clock| (0..=MAX_CLOCK).contains(clock))
                .ok_or_else(|| format!("invalid clock value {raw}"))?;
            match row.get(field::NS) {
                Some(raw) => {
                    let ns = json::as_i64(raw)
                        .filter(|ns| (0..=MAX_NS).contains(ns))
                        .ok_or_else(|| format!("invalid nanosecond value {raw}"))?;
                    (clock, ns)
                }
                None => {
                    let stamped = (clock + shift.sec, shift.ns);
                    shift.ns += 1;
                    if shift.ns > MAX_NS {
                        shift.sec += 1;
                        shift.ns = 0;
                    }
                    stamped
                }
            }
        }
        None => (received.sec, received.ns),
    };

    let state = json::get_u64(row, field::STATE)
        .map(|state| ItemState::from(state.min(u8::MAX as u64) as u8))
        .unwrap_or_default();
    let (lastlogsize, mtime) = if state.is_normal() {
        (
            json::get_u64(row, field::LASTLOGSIZE),
            json::get_i64(row, field::MTIME),
        )
    } else {
        (None, None)
    };
    let value = json::get_text(row, field::VALUE);
    if value.is_none() && lastlogsize.is_none() && mtime.is_none() && state.is_normal() {
        return Err("history row carries no value".to_string());
    }

    Ok(ParsedRow {
        id: json::get_u64(row, field::ID).unwrap_or(0),
        itemid: json::get_u64(row, field::ITEMID),
        host: json::get_text(row, field::HOST),
        key: json::get_text(row, field::KEY),
        record: HistoryRecord {
            itemid: 0,
            clock,
            ns,
            timestamp: json::get_i64(row, field::LOGTIMESTAMP).unwrap_or(0),
            source: json::get_text(row, field::LOGSOURCE).unwrap_or_default(),
            severity: json::get_i64(row, field::LOGSEVERITY).unwrap_or(0),
            logeventid: json::get_i64(row, field::LOGEVENTID).unwrap_or(0),
            state,
            value,
            lastlogsize,
            mtime,
        },
    })
}

/// Checks a data session token, returning it when usable.
pub fn check_session_token(token: Option<String>) -> Result<Option<String>, String> {
    match token {
        Some(token) if token.len() != SESSION_TOKEN_LEN => {
            Err(format!("invalid session token length {}", token.len()))
        }
        other => Ok(other),
    }
}

/// Ingests rows addressed by item id, as sent by proxies and current agents.
pub async fn process_history_by_itemids(
    ctx: &ExchangeContext,
    rows: &[Value],
    session: Option<&SessionHandle>,
    validator: Validator<'_>,
    received: Timespec,
) -> IngestCounts {
    let mut counts = IngestCounts::new();
    let mut shift = Timespec::default();
    let mut last_id = 0u64;

    for chunk in rows.chunks(ctx.config.limits.values_per_chunk.max(1)) {
        let mut accepted = Vec::with_capacity(chunk.len());
        for raw in chunk {
            counts.total += 1;
            let row = match parse_row(raw, received, &mut shift) {
                Ok(row) => row,
                Err(reason) => {
                    debug!(%reason, "skipping unparsable history row");
                    counts.failed += 1;
                    continue;
                }
            };
            // Rejected rows still move the watermark so a resend skips them.
            last_id = last_id.max(row.id);
            if let Some(session) = session {
                if session.is_duplicate(row.id) {
                    counts.skipped += 1;
                    continue;
                }
            }
            let Some(itemid) = row.itemid else {
                counts.failed += 1;
                continue;
            };
            let Some(item) = ctx.services.config.item_by_id(itemid).await else {
                debug!(itemid, "cannot find item in configuration cache");
                counts.failed += 1;
                continue;
            };
            if let Err(reason) = validator.validate(&item) {
                warn!("{reason}");
                counts.failed += 1;
                continue;
            }
            let mut record = row.record;
            record.itemid = item.itemid;
            accepted.push(record);
        }
        deliver(ctx, accepted, &mut counts).await;
    }

    if let Some(session) = session {
        if last_id != 0 {
            if let Err(previous) = session.advance(last_id) {
                warn!("received id:{last_id} is less than last id:{previous}");
            }
        }
    }
    counts.report("itemid");
    counts
}

/// Ingests rows addressed by host and key, as sent by trappers and older
/// agents. Sessions are kept per host.
pub async fn process_history_by_keys(
    ctx: &ExchangeContext,
    rows: &[Value],
    token: Option<&str>,
    validator: Validator<'_>,
    received: Timespec,
) -> IngestCounts {
    let mut counts = IngestCounts::new();
    let mut shift = Timespec::default();
    let mut sessions: HashMap<u64, (SessionHandle, u64)> = HashMap::new();

    for chunk in rows.chunks(ctx.config.limits.values_per_chunk.max(1)) {
        let mut accepted = Vec::with_capacity(chunk.len());
        for raw in chunk {
            counts.total += 1;
            let row = match parse_row(raw, received, &mut shift) {
                Ok(row) => row,
                Err(reason) => {
                    debug!(%reason, "skipping unparsable history row");
                    counts.failed += 1;
                    continue;
                }
            };
            let (Some(host), Some(key)) = (row.host.as_deref(), row.key.as_deref()) else {
                counts.failed += 1;
                continue;
            };
            let Some(item) = ctx.services.config.item_by_key(host, key).await else {
                debug!("cannot retrieve key \"{key}\" on host \"{host}\" from configuration cache");
                counts.failed += 1;
                continue;
            };

            if let Some(token) = token {
                let (session, _) = sessions.entry(item.hostid).or_insert_with(|| {
                    (
                        ctx.sessions.get_or_create(item.hostid, token, SessionType::Data),
                        0,
                    )
                });
                if session.is_duplicate(row.id) {
                    counts.skipped += 1;
                    continue;
                }
            }
            if let Some((_, last_id)) = sessions.get_mut(&item.hostid) {
                *last_id = (*last_id).max(row.id);
            }
            if let Err(reason) = validator.validate(&item) {
                warn!("{reason}");
                counts.failed += 1;
                continue;
            }
            let mut record = row.record;
            record.itemid = item.itemid;
            accepted.push(record);
        }
        deliver(ctx, accepted, &mut counts).await;
    }

    for (session, last_id) in sessions.values() {
        if *last_id != 0 {
            if let Err(previous) = session.advance(*last_id) {
                warn!("received id:{last_id} is less than last id:{previous}");
            }
        }
    }
    counts.report("key");
    counts
}

async fn deliver(ctx: &ExchangeContext, accepted: Vec<HistoryRecord>, counts: &mut IngestCounts) {
    if accepted.is_empty() {
        return;
    }
    let count = accepted.len();
    match ctx.services.history.accept(accepted).await {
        Ok(()) => counts.processed += count,
        Err(err) => {
            warn!(error = %err, values = count, "history cache refused values");
            counts.failed += count;
        }
    }
}

/// Deserializes each element, counting those that do not parse.
pub fn parse_array<T: DeserializeOwned>(rows: &[Value], counts: &mut IngestCounts) -> Vec<T> {
    rows.iter()
        .filter_map(|row| {
            counts.total += 1;
            match serde_json::from_value(row.clone()) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    debug!(error = %err, "skipping unparsable row");
                    counts.failed += 1;
                    None
                }
            }
        })
        .collect()
}

pub async fn process_discovery(
    ctx: &ExchangeContext,
    proxyid: Option<u64>,
    rows: &[Value],
) -> Result<IngestCounts, String> {
    let mut counts = IngestCounts::new();
    let records: Vec<DiscoveryRecord> = parse_array(rows, &mut counts);
    let count = records.len();
    if count > 0 {
        ctx.services
            .discovery
            .discovered(proxyid, records)
            .await
            .map_err(|err| err.to_string())?;
    }
    counts.processed += count;
    counts.report("discovery");
    Ok(counts)
}

pub async fn process_autoreg(
    ctx: &ExchangeContext,
    proxyid: Option<u64>,
    rows: &[Value],
) -> Result<IngestCounts, String> {
    let mut counts = IngestCounts::new();
    let records: Vec<AutoregRecord> = parse_array(rows, &mut counts);
    let count = records.len();
    if count > 0 {
        ctx.services
            .discovery
            .autoregistered(proxyid, records)
            .await
            .map_err(|err| err.to_string())?;
    }
    counts.processed += count;
    counts.report("autoreg");
    Ok(counts)
}

pub async fn process_interfaces(ctx: &ExchangeContext, rows: &[Value]) -> Result<(), String> {
    let mut counts = IngestCounts::new();
    let records: Vec<InterfaceAvailability> = parse_array(rows, &mut counts);
    if records.is_empty() {
        return Ok(());
    }
    ctx.services
        .availability
        .apply_interfaces(records)
        .await
        .map_err(|err| err.to_string())
}

/// What the server learned from one `proxy data` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyDataOutcome {
    pub more: MoreFlag,
    pub proxy_delay: i64,
    /// History processing summary.
    pub info: String,
    /// Newline-joined step failures.
    pub error: Option<String>,
}

impl ProxyDataOutcome {
    /// The acknowledgement for the sending proxy.
    pub fn response(&self) -> Envelope {
        match &self.error {
            None => Envelope::success().with_info(self.info.clone()),
            Some(error) => Envelope::failed(error.clone()),
        }
    }
}

/// Applies every section of a `proxy data` envelope in order. A failing
/// section is reported without stopping the ones after it; an invalid session
/// token stops everything.
pub async fn process_proxy_data(
    ctx: &ExchangeContext,
    proxy: &ProxyRecord,
    envelope: &Envelope,
    received: Timespec,
) -> ProxyDataOutcome {
    let mut outcome = ProxyDataOutcome {
        more: envelope.more(),
        proxy_delay: envelope.field_i64(field::PROXY_DELAY).unwrap_or(0),
        info: IngestCounts::new().info(),
        error: None,
    };
    let mut errors = Vec::new();

    if let Some(rows) = envelope.field_array(field::INTERFACE_AVAILABILITY) {
        if let Err(err) = process_interfaces(ctx, rows).await {
            errors.push(err);
        }
    }

    if let Some(rows) = envelope.field_array(field::HISTORY_DATA) {
        let token = match check_session_token(envelope.field_text(field::SESSION)) {
            Ok(token) => token,
            Err(err) => {
                outcome.error = Some(err);
                return outcome;
            }
        };
        let session = token
            .as_deref()
            .map(|token| ctx.sessions.get_or_create(proxy.proxyid, token, SessionType::Data));
        let counts = process_history_by_itemids(
            ctx,
            rows,
            session.as_ref(),
            Validator::Proxy {
                proxyid: proxy.proxyid,
            },
            received,
        )
        .await;
        outcome.info = counts.info();
    }

    if let Some(rows) = envelope.field_array(field::DISCOVERY_DATA) {
        if let Err(err) = process_discovery(ctx, Some(proxy.proxyid), rows).await {
            errors.push(err);
        }
    }

    if let Some(rows) = envelope.field_array(field::AUTO_REGISTRATION) {
        if let Err(err) = process_autoreg(ctx, Some(proxy.proxyid), rows).await {
            errors.push(err);
        }
    }

    if let Some(rows) = envelope.field_array(field::TASKS) {
        let mut counts = IngestCounts::new();
        let tasks: Vec<TaskRecord> = parse_array(rows, &mut counts);
        if !tasks.is_empty() {
            if let Err(err) = ctx.services.tasks.save_received(Some(proxy.proxyid), tasks).await {
                errors.push(err.to_string());
            }
        }
    }

    if let Some(rows) = envelope.field_array(field::HOST_DATA) {
        let mut counts = IngestCounts::new();
        let statuses: Vec<HostActiveStatus> = parse_array(rows, &mut counts);
        let monitored = ctx.services.config.hosts_of_proxy(proxy.proxyid).await;
        let statuses: Vec<_> = statuses
            .into_iter()
            .filter(|status| monitored.contains(&status.hostid))
            .collect();
        if !statuses.is_empty() {
            if let Err(err) = ctx.services.availability.apply_active_status(statuses).await {
                errors.push(err.to_string());
            }
        }
    }

    if !errors.is_empty() {
        outcome.error = Some(errors.join("\n"));
    }
    outcome
}

/// Builds a single host/key row for the legacy value paths.
pub fn single_row(host: &str, key: &str, value: &str) -> Value {
    let mut row = Map::new();
    row.insert(field::HOST.to_string(), Value::from(host));
    row.insert(field::KEY.to_string(), Value::from(key));
    row.insert(field::VALUE.to_string(), Value::from(value));
    Value::Object(row)
}

//! Pre-JSON agent and sender protocols: a single value per connection and
//! the line-based active check list.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use proxy_wire::tags::field;
use serde_json::Value;
use tracing::{debug, warn};

use super::Connection;
use crate::clock::Timespec;
use crate::collab::HostLookup;
use crate::context::ExchangeContext;
use crate::error::ExchangeResult;
use crate::ingest::{process_history_by_keys, single_row, Validator};

pub const ACTIVE_CHECKS_MARKER: &[u8] = b"ZBX_GET_ACTIVE_CHECKS";

const NOT_SUPPORTED_MARKER: &str = "ZBX_NOTSUPPORTED";
const END_OF_LIST: &[u8] = b"ZBX_EOF\n";
const ITEM_STATE_NOT_SUPPORTED: u64 = 1;

/// A value pushed in one of the legacy formats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyValue {
    pub host: String,
    pub key: String,
    pub value: String,
    pub lastlogsize: Option<u64>,
    pub timestamp: Option<i64>,
    pub source: Option<String>,
    pub severity: Option<i64>,
}

impl LegacyValue {
    /// Parses the XML form when the payload starts with `<`, otherwise
    /// `host:key:value` split on the first two colons.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(payload);
        if text.starts_with('<') {
            Self::parse_xml(&text)
        } else {
            Self::parse_plain(&text)
        }
    }

    fn parse_plain(text: &str) -> Option<Self> {
        let mut parts = text.splitn(3, ':');
        let host = parts.next()?;
        let key = parts.next()?;
        let value = parts.next()?;
        Some(Self {
            host: host.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            ..Self::default()
        })
    }

    fn parse_xml(text: &str) -> Option<Self> {
        Some(Self {
            host: xml_base64(text, "host")?,
            key: xml_base64(text, "key")?,
            value: xml_base64(text, "data")?,
            lastlogsize: xml_tag(text, "lastlogsize").and_then(|raw| raw.trim().parse().ok()),
            timestamp: xml_base64(text, "timestamp").and_then(|raw| raw.trim().parse().ok()),
            source: xml_base64(text, "source"),
            severity: xml_base64(text, "severity").and_then(|raw| raw.trim().parse().ok()),
        })
    }

    /// The history row this value ingests as.
    pub fn to_row(&self) -> Value {
        let mut row = match self.value.strip_prefix(NOT_SUPPORTED_MARKER) {
            Some(error) => {
                let error = error.trim_start_matches(['\0', ' ', ':']);
                let mut row = single_row(&self.host, &self.key, error);
                if let Value::Object(map) = &mut row {
                    map.insert(field::STATE.to_string(), Value::from(ITEM_STATE_NOT_SUPPORTED));
                }
                row
            }
            None => single_row(&self.host, &self.key, &self.value),
        };
        if let Value::Object(map) = &mut row {
            if let Some(lastlogsize) = self.lastlogsize {
                map.insert(field::LASTLOGSIZE.to_string(), Value::from(lastlogsize));
            }
            if let Some(timestamp) = self.timestamp {
                map.insert(field::LOGTIMESTAMP.to_string(), Value::from(timestamp));
            }
            if let Some(source) = &self.source {
                map.insert(field::LOGSOURCE.to_string(), Value::from(source.as_str()));
            }
            if let Some(severity) = self.severity {
                map.insert(field::LOGSEVERITY.to_string(), Value::from(severity));
            }
        }
        row
    }
}

fn xml_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = start + text[start..].find(&close)?;
    Some(&text[start..end])
}

fn xml_base64(text: &str, tag: &str) -> Option<String> {
    let raw = xml_tag(text, tag)?;
    let bytes = BASE64_STANDARD.decode(raw.trim()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Ingests one legacy value and answers with a bare `OK`.
pub async fn single_value(
    ctx: &ExchangeContext,
    conn: &mut Connection,
    payload: &[u8],
    received: Timespec,
) -> ExchangeResult<()> {
    let Some(value) = LegacyValue::parse(payload) else {
        debug!(peer = %conn.peer.address, "ignoring malformed legacy value");
        return Ok(());
    };
    let rows = [value.to_row()];
    let counts = process_history_by_keys(
        ctx,
        &rows,
        None,
        Validator::Legacy,
        received,
    )
    .await;
    debug!(peer = %conn.peer.address, host = %value.host, key = %value.key, "{counts}");
    conn.send_raw(b"OK").await
}

/// Answers `ZBX_GET_ACTIVE_CHECKS\n<host>` with one `key:delay:lastlogsize`
/// line per check, terminated by `ZBX_EOF`.
pub async fn active_checks(ctx: &ExchangeContext, conn: &mut Connection, payload: &[u8]) -> ExchangeResult<()> {
    let text = String::from_utf8_lossy(&payload[ACTIVE_CHECKS_MARKER.len()..]).into_owned();
    let host = text.trim();
    let mut reply = Vec::new();

    match ctx.services.config.host_by_name(host, &conn.peer).await {
        HostLookup::Found(_) => match ctx.services.config.active_checks(host).await {
            Ok(checks) => {
                for check in checks {
                    reply.extend_from_slice(format!("{}:{}:{}\n", check.key, check.delay, check.lastlogsize).as_bytes());
                }
            }
            Err(err) => warn!("cannot send list of active checks to \"{}\": {err}", conn.peer.address),
        },
        _ => warn!(
            "cannot send list of active checks to \"{}\": host [{host}] not found",
            conn.peer.address
        ),
    }
    reply.extend_from_slice(END_OF_LIST);
    conn.send_raw(&reply).await
}

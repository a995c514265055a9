//! Records carried by the data streams, and the wire encoding of each.
//!
//! Fields equal to their declared default are omitted on encode and restored on
//! decode, so a record survives the trip field for field.

use proxy_wire::tags::field;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A cursor-tracked data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    History,
    Discovery,
    Autoreg,
}

/// Identity of a durable cursor: the `(table, field)` pair of the id table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorKey {
    pub table: &'static str,
    pub field: &'static str,
}

impl Stream {
    pub const ALL: [Stream; 3] = [Stream::History, Stream::Discovery, Stream::Autoreg];

    pub fn table(self) -> &'static str {
        match self {
            Stream::History => "proxy_history",
            Stream::Discovery => "proxy_dhistory",
            Stream::Autoreg => "proxy_autoreg_host",
        }
    }

    pub fn cursor(self) -> CursorKey {
        let field = match self {
            Stream::History => "history_lastid",
            Stream::Discovery => "dhistory_lastid",
            Stream::Autoreg => "autoreg_host_lastid",
        };
        CursorKey {
            table: self.table(),
            field,
        }
    }

    /// Envelope key the stream's array travels under.
    pub fn data_tag(self) -> &'static str {
        match self {
            Stream::History => field::HISTORY_DATA,
            Stream::Discovery => field::DISCOVERY_DATA,
            Stream::Autoreg => field::AUTO_REGISTRATION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ItemState {
    #[default]
    Normal,
    NotSupported,
}

impl ItemState {
    pub fn is_normal(&self) -> bool {
        *self == ItemState::Normal
    }
}

impl From<u8> for ItemState {
    fn from(value: u8) -> Self {
        if value == 1 {
            ItemState::NotSupported
        } else {
            ItemState::Normal
        }
    }
}

impl From<ItemState> for u8 {
    fn from(value: ItemState) -> Self {
        match value {
            ItemState::Normal => 0,
            ItemState::NotSupported => 1,
        }
    }
}

/// One collected item value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct HistoryRecord {
    pub itemid: u64,
    pub clock: i64,
    pub ns: i64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub timestamp: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub severity: i64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub logeventid: i64,
    #[serde(skip_serializing_if = "ItemState::is_normal")]
    pub state: ItemState,
    /// Absent for meta-only updates of log items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastlogsize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
}

/// Network discovery result for a host (`dcheckid` absent) or a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    #[serde(deserialize_with = "lenient::i64")]
    pub clock: i64,
    #[serde(deserialize_with = "lenient::u64")]
    pub druleid: u64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::opt_u64"
    )]
    pub dcheckid: Option<u64>,
    #[serde(rename = "type", deserialize_with = "lenient::i64")]
    pub check_type: i64,
    #[serde(deserialize_with = "lenient::string")]
    pub ip: String,
    #[serde(deserialize_with = "lenient::string")]
    pub dns: String,
    #[serde(
        default,
        skip_serializing_if = "is_zero_u16",
        deserialize_with = "lenient::u16"
    )]
    pub port: u16,
    #[serde(
        rename = "key_",
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "lenient::string"
    )]
    pub key: String,
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "lenient::string"
    )]
    pub value: String,
    #[serde(
        default,
        skip_serializing_if = "is_zero_i64",
        deserialize_with = "lenient::i64"
    )]
    pub status: i64,
}

/// Active agent auto-registration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutoregRecord {
    #[serde(deserialize_with = "lenient::i64")]
    pub clock: i64,
    #[serde(deserialize_with = "lenient::string")]
    pub host: String,
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "lenient::string"
    )]
    pub ip: String,
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "lenient::string"
    )]
    pub dns: String,
    #[serde(
        default,
        skip_serializing_if = "is_zero_u16",
        deserialize_with = "lenient::u16"
    )]
    pub port: u16,
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "lenient::string"
    )]
    pub host_metadata: String,
    #[serde(
        default,
        skip_serializing_if = "is_zero_i64",
        deserialize_with = "lenient::i64"
    )]
    pub flags: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAvailability {
    #[serde(deserialize_with = "lenient::u64")]
    pub interfaceid: u64,
    #[serde(deserialize_with = "lenient::i64")]
    pub available: i64,
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "lenient::string"
    )]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostActiveStatus {
    #[serde(deserialize_with = "lenient::u64")]
    pub hostid: u64,
    #[serde(deserialize_with = "lenient::i64")]
    pub active_status: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    New,
    InProgress,
    Done,
    Expired,
}

/// Remote command request or its result, piggybacked on data exchanges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(deserialize_with = "lenient::u64")]
    pub taskid: u64,
    #[serde(rename = "type", deserialize_with = "lenient::i64")]
    pub kind: i64,
    #[serde(deserialize_with = "lenient::i64")]
    pub clock: i64,
    #[serde(default, deserialize_with = "lenient::i64")]
    pub ttl: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// A row in one of the staging tables.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    History(HistoryRecord),
    Discovery(DiscoveryRecord),
    Autoreg(AutoregRecord),
}

impl Record {
    pub fn stream(&self) -> Stream {
        match self {
            Record::History(_) => Stream::History,
            Record::Discovery(_) => Stream::Discovery,
            Record::Autoreg(_) => Stream::Autoreg,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub id: u64,
    /// Wall clock when the row was buffered; feeds the proxy delay.
    pub write_clock: i64,
    pub record: Record,
}

impl StagedRow {
    /// Wire object for this row. History rows carry their id for receiver dedup.
    pub fn to_json(&self) -> Value {
        let encoded = match &self.record {
            Record::History(record) => serde_json::to_value(record),
            Record::Discovery(record) => serde_json::to_value(record),
            Record::Autoreg(record) => serde_json::to_value(record),
        };
        let mut object = match encoded {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Record::History(_) = self.record {
            object.insert(field::ID.to_string(), Value::from(self.id));
        }
        Value::Object(object)
    }
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

fn is_zero_u16(value: &u16) -> bool {
    *value == 0
}

/// Deserializers accepting numbers or numeric strings.
pub(crate) mod lenient {
    use proxy_wire::json;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn u64<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
        let value = Value::deserialize(de)?;
        json::as_u64(&value)
            .ok_or_else(|| D::Error::custom(format!("expected unsigned integer, found {value}")))
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
        let value = Value::deserialize(de)?;
        if value.is_null() {
            return Ok(None);
        }
        json::as_u64(&value)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected unsigned integer, found {value}")))
    }

    pub fn i64<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(de)?;
        json::as_i64(&value)
            .ok_or_else(|| D::Error::custom(format!("expected integer, found {value}")))
    }

    pub fn u16<'de, D: Deserializer<'de>>(de: D) -> Result<u16, D::Error> {
        let value = Value::deserialize(de)?;
        json::as_u64(&value)
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| D::Error::custom(format!("expected port number, found {value}")))
    }

    pub fn string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
        let value = Value::deserialize(de)?;
        json::as_text(&value).ok_or_else(|| D::Error::custom(format!("expected string, found {value}")))
    }
}

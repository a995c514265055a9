use std::collections::BTreeMap;

use serde::ser::{Error as _, Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::json;
use crate::tags::{field, value, RequestTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success,
    Failed,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Success => value::SUCCESS,
            ResponseStatus::Failed => value::FAILED,
        }
    }
}

/// Continuation signal carried by data exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoreFlag {
    #[default]
    Done,
    More,
}

impl MoreFlag {
    pub fn as_int(self) -> u8 {
        match self {
            MoreFlag::Done => 0,
            MoreFlag::More => 1,
        }
    }

    pub fn from_int(value: u64) -> Self {
        if value == 0 {
            MoreFlag::Done
        } else {
            MoreFlag::More
        }
    }

    /// Any stream reporting more data makes the aggregate report more.
    pub fn merge(self, other: MoreFlag) -> MoreFlag {
        if self == MoreFlag::More || other == MoreFlag::More {
            MoreFlag::More
        } else {
            MoreFlag::Done
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Raw request tag; may be outside [`RequestTag`] when the peer is newer or older.
    Request(String),
    Response(ResponseStatus),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("empty string received")]
    Empty,
    #[error("cannot parse as a valid JSON object: {0}")]
    InvalidJson(String),
    #[error("cannot find the \"{0}\" tag")]
    MissingTag(&'static str),
    #[error("cannot serialize JSON: {0}")]
    Serialize(String),
}

/// One request or response exchanged over a single connection.
///
/// Header fields are kept apart from the free-form `fields` so the encoder can
/// put the tag first, then `info` and `version`, then everything else in key
/// order, then the sender timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub info: Option<String>,
    pub version: Option<String>,
    pub fields: BTreeMap<String, Value>,
    pub clock: Option<i64>,
    pub ns: Option<i64>,
}

impl Envelope {
    fn with_kind(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            info: None,
            version: None,
            fields: BTreeMap::new(),
            clock: None,
            ns: None,
        }
    }

    pub fn request(tag: RequestTag) -> Self {
        Self::with_kind(EnvelopeKind::Request(tag.as_str().to_string()))
    }

    pub fn raw_request(tag: impl Into<String>) -> Self {
        Self::with_kind(EnvelopeKind::Request(tag.into()))
    }

    pub fn response(status: ResponseStatus) -> Self {
        Self::with_kind(EnvelopeKind::Response(status))
    }

    pub fn success() -> Self {
        Self::response(ResponseStatus::Success)
    }

    pub fn failed(info: impl Into<String>) -> Self {
        Self::response(ResponseStatus::Failed).with_info(info)
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_version(mut self, version: impl ToString) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_clock(mut self, clock: i64, ns: i64) -> Self {
        self.clock = Some(clock);
        self.ns = Some(ns);
        self
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn take_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn field_text(&self, key: &str) -> Option<String> {
        self.fields.get(key).and_then(json::as_text)
    }

    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(json::as_u64)
    }

    pub fn field_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(json::as_i64)
    }

    /// Array payload under `key`. Absent and empty are not distinguished.
    pub fn field_array(&self, key: &str) -> Option<&Vec<Value>> {
        match self.fields.get(key) {
            Some(Value::Array(items)) if !items.is_empty() => Some(items),
            _ => None,
        }
    }

    pub fn request_str(&self) -> Option<&str> {
        match &self.kind {
            EnvelopeKind::Request(tag) => Some(tag),
            EnvelopeKind::Response(_) => None,
        }
    }

    pub fn request_tag(&self) -> Option<RequestTag> {
        self.request_str().and_then(RequestTag::lookup)
    }

    pub fn status(&self) -> Option<ResponseStatus> {
        match self.kind {
            EnvelopeKind::Response(status) => Some(status),
            EnvelopeKind::Request(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == Some(ResponseStatus::Success)
    }

    /// `more` flag; absent or unreadable means done.
    pub fn more(&self) -> MoreFlag {
        self.field_u64(field::MORE)
            .map(MoreFlag::from_int)
            .unwrap_or_default()
    }

    pub fn set_more(&mut self, more: MoreFlag) {
        if more == MoreFlag::More {
            self.fields
                .insert(field::MORE.to_string(), Value::from(more.as_int()));
        } else {
            self.fields.remove(field::MORE);
        }
    }

    /// Serializes the envelope. Never yields an empty payload, since peers
    /// read one as a legacy reply.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|err| EnvelopeError::Serialize(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let trimmed = trim_trailing(bytes);
        if trimmed.iter().all(u8::is_ascii_whitespace) {
            return Err(EnvelopeError::Empty);
        }

        let value: Value = serde_json::from_slice(trimmed)
            .map_err(|err| EnvelopeError::InvalidJson(err.to_string()))?;
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Err(EnvelopeError::InvalidJson(
                "top-level value is not an object".to_string(),
            )),
        }
    }

    pub fn from_map(mut map: Map<String, Value>) -> Result<Self, EnvelopeError> {
        let kind = if let Some(tag) = map.remove(field::REQUEST) {
            match tag {
                Value::String(tag) => EnvelopeKind::Request(tag),
                _ => return Err(EnvelopeError::MissingTag(field::REQUEST)),
            }
        } else if let Some(status) = map.remove(field::RESPONSE) {
            match status.as_str() {
                Some(value::SUCCESS) => EnvelopeKind::Response(ResponseStatus::Success),
                Some(_) => EnvelopeKind::Response(ResponseStatus::Failed),
                None => return Err(EnvelopeError::MissingTag(field::RESPONSE)),
            }
        } else {
            return Err(EnvelopeError::MissingTag(field::REQUEST));
        };

        let info = map.remove(field::INFO).as_ref().and_then(json::as_text);
        let version = map.remove(field::VERSION).as_ref().and_then(json::as_text);
        let clock = map.remove(field::CLOCK).as_ref().and_then(json::as_i64);
        let ns = map.remove(field::NS).as_ref().and_then(json::as_i64);

        Ok(Self {
            kind,
            info,
            version,
            fields: map.into_iter().collect(),
            clock,
            ns,
        })
    }
}

const HEADER_TAGS: [&str; 6] = [field::REQUEST, field::RESPONSE, field::INFO, field::VERSION, field::CLOCK, field::NS];

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match &self.kind {
            EnvelopeKind::Request(tag) => map.serialize_entry(field::REQUEST, tag)?,
            EnvelopeKind::Response(status) => {
                map.serialize_entry(field::RESPONSE, status.as_str())?
            }
        }
        if let Some(info) = &self.info {
            map.serialize_entry(field::INFO, info)?;
        }
        if let Some(version) = &self.version {
            map.serialize_entry(field::VERSION, version)?;
        }
        for (key, value) in &self.fields {
            if HEADER_TAGS.contains(&key.as_str()) {
                return Err(S::Error::custom(format!("field \"{key}\" clashes with a header tag")));
            }
            map.serialize_entry(key, value)?;
        }
        if let Some(clock) = self.clock {
            map.serialize_entry(field::CLOCK, &clock)?;
        }
        if let Some(ns) = self.ns {
            map.serialize_entry(field::NS, &ns)?;
        }
        map.end()
    }
}

fn trim_trailing(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\r' | b'\n' | b'\t' | 0))
        .map(|idx| idx + 1)
        .unwrap_or(0);
    &bytes[..end]
}

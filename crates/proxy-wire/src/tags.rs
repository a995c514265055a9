use std::fmt;
use std::str::FromStr;

/// Closed set of request tags understood by this build.
///
/// Matching is exact and case-sensitive. Anything else is carried through the
/// envelope as a raw string so receivers can log and ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTag {
    ProxyConfig,
    AgentData,
    SenderData,
    ProxyData,
    HistoryData,
    DiscoveryData,
    AutoRegistration,
    ProxyHeartbeat,
    GetActiveChecks,
    ActiveCheckHeartbeat,
    HostAvailability,
    Command,
    GetQueue,
    ProxyTasks,
}

impl RequestTag {
    pub const ALL: [RequestTag; 14] = [
        RequestTag::ProxyConfig,
        RequestTag::AgentData,
        RequestTag::SenderData,
        RequestTag::ProxyData,
        RequestTag::HistoryData,
        RequestTag::DiscoveryData,
        RequestTag::AutoRegistration,
        RequestTag::ProxyHeartbeat,
        RequestTag::GetActiveChecks,
        RequestTag::ActiveCheckHeartbeat,
        RequestTag::HostAvailability,
        RequestTag::Command,
        RequestTag::GetQueue,
        RequestTag::ProxyTasks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestTag::ProxyConfig => "proxy config",
            RequestTag::AgentData => "agent data",
            RequestTag::SenderData => "sender data",
            RequestTag::ProxyData => "proxy data",
            RequestTag::HistoryData => "history data",
            RequestTag::DiscoveryData => "discovery data",
            RequestTag::AutoRegistration => "auto registration",
            RequestTag::ProxyHeartbeat => "proxy heartbeat",
            RequestTag::GetActiveChecks => "active checks",
            RequestTag::ActiveCheckHeartbeat => "active check heartbeat",
            RequestTag::HostAvailability => "host availability",
            RequestTag::Command => "command",
            RequestTag::GetQueue => "queue.get",
            RequestTag::ProxyTasks => "proxy tasks",
        }
    }

    pub fn lookup(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == value)
    }
}

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTag(pub String);

impl fmt::Display for UnknownTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown request tag \"{}\"", self.0)
    }
}

impl std::error::Error for UnknownTag {}

impl FromStr for RequestTag {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| UnknownTag(s.to_string()))
    }
}

/// Object keys used inside envelopes and data rows.
pub mod field {
    pub const REQUEST: &str = "request";
    pub const RESPONSE: &str = "response";
    pub const INFO: &str = "info";
    pub const VERSION: &str = "version";
    pub const CLOCK: &str = "clock";
    pub const NS: &str = "ns";
    pub const DATA: &str = "data";
    pub const HOST: &str = "host";
    pub const KEY: &str = "key";
    pub const VALUE: &str = "value";
    pub const SESSION: &str = "session";
    pub const SID: &str = "sid";
    pub const MORE: &str = "more";
    pub const PROXY_DELAY: &str = "proxy_delay";
    pub const REDIRECT: &str = "redirect";
    pub const REVISION: &str = "revision";
    pub const ADDRESS: &str = "address";
    pub const RESET: &str = "reset";

    pub const HISTORY_DATA: &str = "history data";
    pub const DISCOVERY_DATA: &str = "discovery data";
    pub const AUTO_REGISTRATION: &str = "auto registration";
    pub const INTERFACE_AVAILABILITY: &str = "interface availability";
    pub const HOST_DATA: &str = "host data";
    pub const TASKS: &str = "tasks";

    pub const ID: &str = "id";
    pub const ITEMID: &str = "itemid";
    pub const STATE: &str = "state";
    pub const LASTLOGSIZE: &str = "lastlogsize";
    pub const MTIME: &str = "mtime";
    pub const LOGTIMESTAMP: &str = "timestamp";
    pub const LOGSOURCE: &str = "source";
    pub const LOGSEVERITY: &str = "severity";
    pub const LOGEVENTID: &str = "logeventid";
    pub const HEARTBEAT_FREQ: &str = "heartbeat_freq";
    pub const HOSTID: &str = "hostid";
    pub const ACTIVE_STATUS: &str = "active_status";
}

/// Response status strings.
pub mod value {
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
    pub const UNDEFINED_VERSION: &str = "undefined";
}

//! Runtime context shared by every handler and background loop of a node.

use std::fmt;
use std::str::FromStr;

use proxy_wire::{classify_compatibility, parse_version, Compatibility, RemoteVersion, Version};
use tracing::{debug, warn};

use crate::clock::unix_now;
use crate::collab::{ConnectionType, PeerInfo, ProxyMode, ProxyRecord, Services, TlsAccept};
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, ExchangeResult};
use crate::session::{new_session_token, SessionRegistry};
use crate::throttle::LogThrottle;

/// Protocol version this build speaks.
pub const LOCAL_VERSION: Version = Version::new(7, 0, 0);

/// Version assumed for proxies that predate version reporting.
pub const LEGACY_PROXY_VERSION: Version = Version::new(3, 2, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramType {
    Server,
    ProxyActive,
    ProxyPassive,
}

impl ProgramType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgramType::Server => "server",
            ProgramType::ProxyActive => "proxy-active",
            ProgramType::ProxyPassive => "proxy-passive",
        }
    }

    pub fn is_proxy(self) -> bool {
        !matches!(self, ProgramType::Server)
    }
}

impl fmt::Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgramType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(ProgramType::Server),
            "proxy-active" | "active" => Ok(ProgramType::ProxyActive),
            "proxy-passive" | "passive" => Ok(ProgramType::ProxyPassive),
            other => Err(format!("unknown program type \"{other}\"")),
        }
    }
}

/// Which servers a passive proxy answers, and over what.
#[derive(Debug, Clone, Default)]
pub struct ServerPolicy {
    /// Peers allowed to poll this proxy; empty allows any.
    pub servers: Vec<String>,
    pub tls_accept: TlsAccept,
    pub tls_issuer: Option<String>,
    pub tls_subject: Option<String>,
    pub psk_identity: Option<String>,
}

impl ServerPolicy {
    pub fn check(&self, request: &str, peer: &PeerInfo) -> Result<(), String> {
        if !self.servers.is_empty() && !peer.matches_any(&self.servers) {
            return Err("connection is not allowed".to_string());
        }
        if !self.tls_accept.allows(peer.connection) {
            return Err(format!(
                "{request} over connection of type \"{}\" is not allowed",
                peer.connection
            ));
        }
        match peer.connection {
            ConnectionType::Cert => {
                if mismatch(&self.tls_issuer, &peer.issuer) || mismatch(&self.tls_subject, &peer.subject) {
                    return Err("certificate issuer or subject mismatch".to_string());
                }
            }
            ConnectionType::Psk => {
                if mismatch(&self.psk_identity, &peer.psk_identity) {
                    return Err("wrong PSK used".to_string());
                }
            }
            ConnectionType::Unencrypted => {}
        }
        Ok(())
    }
}

fn mismatch(expected: &Option<String>, actual: &Option<String>) -> bool {
    match expected {
        Some(expected) if !expected.is_empty() => actual.as_deref() != Some(expected.as_str()),
        _ => false,
    }
}

/// Everything a node threads through its handlers: role, version, settings,
/// collaborators and the session table.
pub struct ExchangeContext {
    pub role: ProgramType,
    pub version: Version,
    /// Name this node reports upstream when running as a proxy.
    pub hostname: String,
    pub config: ExchangeConfig,
    pub services: Services,
    pub sessions: SessionRegistry,
    pub throttle: LogThrottle,
    pub server_policy: ServerPolicy,
    /// Data session token this process sends upstream.
    pub session_token: String,
}

impl ExchangeContext {
    pub fn new(role: ProgramType, services: Services) -> Self {
        Self {
            role,
            version: LOCAL_VERSION,
            hostname: String::new(),
            config: ExchangeConfig::default(),
            services,
            sessions: SessionRegistry::default(),
            throttle: LogThrottle::new(),
            server_policy: ServerPolicy::default(),
            session_token: new_session_token(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_config(mut self, config: ExchangeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sessions(mut self, sessions: SessionRegistry) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_server_policy(mut self, policy: ServerPolicy) -> Self {
        self.server_policy = policy;
        self
    }

    /// Classifies the version a proxy reported. A missing version means a
    /// proxy older than version reporting.
    ///
    /// Unsupported and outdated proxies are warned about at most once per
    /// interval per proxy.
    pub fn classify_proxy_version(&self, proxy: &str, reported: Option<&str>) -> (RemoteVersion, Compatibility) {
        let version = match reported {
            None => RemoteVersion::Known(LEGACY_PROXY_VERSION),
            Some(raw) => parse_version(raw).unwrap_or_else(|err| {
                debug!(proxy, error = %err, "cannot parse proxy version");
                RemoteVersion::Undefined
            }),
        };
        let compatibility = classify_compatibility(self.version, version.packed());
        let throttle_key = format!("proxy-version:{proxy}");
        let interval = self.config.version_log_interval;

        match (compatibility, version) {
            (Compatibility::Outdated, RemoteVersion::Known(remote)) => {
                if self.throttle.should_log(&throttle_key, interval) {
                    warn!(
                        "Proxy \"{proxy}\" version {remote} is outdated, only data collection and remote execution is available with server version {}.",
                        self.version
                    );
                }
            }
            (Compatibility::Unsupported, RemoteVersion::Known(remote)) => {
                if self.throttle.should_log(&throttle_key, interval) {
                    warn!(
                        "Proxy \"{proxy}\" version {remote} is not supported by server version {}.",
                        self.version
                    );
                }
            }
            _ => {}
        }
        (version, compatibility)
    }

    /// Like [`classify_proxy_version`](Self::classify_proxy_version), but fails
    /// for proxies that may not proceed.
    pub fn proxy_compatibility(
        &self,
        proxy: &str,
        reported: Option<&str>,
    ) -> ExchangeResult<(RemoteVersion, Compatibility)> {
        require_supported(self.classify_proxy_version(proxy, reported))
    }

    /// Resolves the active proxy named in a request and checks that `peer` may
    /// speak for it.
    pub async fn active_proxy(&self, name: Option<&str>, peer: &PeerInfo) -> ExchangeResult<ProxyRecord> {
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(ExchangeError::Protocol("missing name of proxy".to_string())),
        };
        let proxy = self
            .services
            .config
            .proxy_by_name(name)
            .await
            .ok_or_else(|| ExchangeError::Config(format!("proxy \"{name}\" not found")))?;
        if proxy.mode == ProxyMode::Passive {
            return Err(ExchangeError::Config(format!(
                "proxy \"{name}\" is configured in passive mode"
            )));
        }

        if let Err(reason) = proxy_permission(&proxy, peer) {
            warn!(
                "cannot accept connection from proxy \"{}\" at \"{}\", allowed address: \"{}\": {reason}",
                proxy.name,
                peer.address,
                proxy.allowed_addresses.join(",")
            );
            return Err(ExchangeError::Config(reason));
        }
        Ok(proxy)
    }

    /// Passive proxies answer only the configured servers.
    pub fn check_server_access(&self, request: &str, peer: &PeerInfo) -> Result<(), String> {
        self.server_policy.check(request, peer).map_err(|reason| {
            warn!(peer = %peer.address, "{request} from server \"{}\" is not allowed: {reason}", peer.address);
            reason
        })
    }

    /// Stores what the last exchange revealed about a proxy.
    pub async fn record_proxy_access(
        &self,
        proxy: &ProxyRecord,
        version: Option<(RemoteVersion, Compatibility)>,
        compressed: bool,
    ) {
        let config = &self.services.config;
        let mut runtime = config.proxy_runtime(proxy.proxyid).await;
        if let Some((version, compatibility)) = version {
            runtime.version = match version {
                RemoteVersion::Known(version) => Some(version),
                RemoteVersion::Undefined => None,
            };
            runtime.compatibility = Some(compatibility);
        }
        runtime.lastaccess = unix_now();
        runtime.compress = compressed;
        config.update_proxy_runtime(proxy.proxyid, runtime).await;
    }
}

/// Passes current and outdated proxies; anything else is not supported.
pub fn require_supported(
    classified: (RemoteVersion, Compatibility),
) -> ExchangeResult<(RemoteVersion, Compatibility)> {
    match classified {
        (_, Compatibility::Current) | (RemoteVersion::Known(_), Compatibility::Outdated) => Ok(classified),
        (RemoteVersion::Known(remote), _) => Err(ExchangeError::NotSupported(format!(
            "proxy version {remote} is not supported"
        ))),
        (RemoteVersion::Undefined, _) => Err(ExchangeError::NotSupported(
            "proxy version is undefined".to_string(),
        )),
    }
}

/// Whether `peer` may speak for `proxy`.
pub fn proxy_permission(proxy: &ProxyRecord, peer: &PeerInfo) -> Result<(), String> {
    if !proxy.allowed_addresses.is_empty() && !peer.matches_any(&proxy.allowed_addresses) {
        return Err("connection is not allowed".to_string());
    }
    if !proxy.tls_accept.allows(peer.connection) {
        return Err(format!(
            "connection of type \"{}\" is not allowed for proxy \"{}\"",
            peer.connection, proxy.name
        ));
    }
    match peer.connection {
        ConnectionType::Cert => {
            if mismatch(&proxy.tls_issuer, &peer.issuer) {
                return Err(format!("proxy \"{}\" certificate issuer does not match", proxy.name));
            }
            if mismatch(&proxy.tls_subject, &peer.subject) {
                return Err(format!("proxy \"{}\" certificate subject does not match", proxy.name));
            }
        }
        ConnectionType::Psk => {
            if mismatch(&proxy.psk_identity, &peer.psk_identity) {
                return Err(format!("proxy \"{}\" is using false PSK identity", proxy.name));
            }
        }
        ConnectionType::Unencrypted => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServices;

    fn proxy(mode: ProxyMode) -> ProxyRecord {
        ProxyRecord {
            proxyid: 1,
            name: "edge".into(),
            mode,
            address: "127.0.0.1".into(),
            port: 10051,
            allowed_addresses: Vec::new(),
            tls_accept: TlsAccept::default(),
            tls_issuer: None,
            tls_subject: None,
            psk_identity: None,
        }
    }

    fn context() -> (MemoryServices, ExchangeContext) {
        let memory = MemoryServices::new();
        let ctx = ExchangeContext::new(ProgramType::Server, memory.server())
            .with_version(Version::new(6, 4, 0));
        (memory, ctx)
    }

    #[test]
    fn program_types_parse() {
        assert_eq!("proxy-active".parse::<ProgramType>(), Ok(ProgramType::ProxyActive));
        assert_eq!("Server".parse::<ProgramType>(), Ok(ProgramType::Server));
        assert!("agent".parse::<ProgramType>().is_err());
        assert!(ProgramType::ProxyPassive.is_proxy());
    }

    #[test]
    fn outdated_proxies_proceed_and_unsupported_fail() {
        let (_, ctx) = context();
        let (version, compatibility) = ctx
            .proxy_compatibility("edge", Some("6.0.5"))
            .expect("outdated proceeds");
        assert_eq!(version, RemoteVersion::Known(Version::new(6, 0, 5)));
        assert_eq!(compatibility, Compatibility::Outdated);

        let err = ctx
            .proxy_compatibility("edge", Some("7.0.0"))
            .expect_err("newer proxy");
        assert_eq!(err.kind(), crate::error::ErrorKind::NotSupported);

        assert!(ctx.proxy_compatibility("edge", Some("undefined")).is_err());
        // Unversioned proxies count as 3.2, far outside the window.
        assert!(ctx.proxy_compatibility("old", None).is_err());
    }

    #[test]
    fn unsupported_versions_are_still_classified() {
        let (_, ctx) = context();
        let classified = ctx.classify_proxy_version("edge", Some("7.0.0"));
        assert_eq!(classified, (RemoteVersion::Known(Version::new(7, 0, 0)), Compatibility::Unsupported));
        assert!(require_supported(classified).is_err());

        let undefined = ctx.classify_proxy_version("edge", Some("x.y"));
        assert_eq!(undefined, (RemoteVersion::Undefined, Compatibility::Undefined));
        assert!(require_supported(undefined).is_err());
    }

    #[tokio::test]
    async fn active_proxy_identity_is_checked() {
        let (memory, ctx) = context();
        let peer = PeerInfo::unencrypted("10.0.0.1");
        let err = ctx.active_proxy(None, &peer).await.expect_err("missing");
        assert_eq!(err.to_string(), "missing name of proxy");
        let err = ctx.active_proxy(Some("edge"), &peer).await.expect_err("unknown");
        assert_eq!(err.to_string(), "proxy \"edge\" not found");

        memory.config.add_proxy(proxy(ProxyMode::Passive));
        let err = ctx.active_proxy(Some("edge"), &peer).await.expect_err("passive");
        assert_eq!(err.to_string(), "proxy \"edge\" is configured in passive mode");

        let mut active = proxy(ProxyMode::Active);
        active.allowed_addresses = vec!["10.0.0.2".into()];
        memory.config.add_proxy(active);
        let err = ctx.active_proxy(Some("edge"), &peer).await.expect_err("address");
        assert_eq!(err.to_string(), "connection is not allowed");
        let allowed = PeerInfo::unencrypted("10.0.0.2");
        assert!(ctx.active_proxy(Some("edge"), &allowed).await.is_ok());
    }

    #[test]
    fn proxy_permission_checks_tls() {
        let mut record = proxy(ProxyMode::Active);
        let psk = PeerInfo {
            connection: ConnectionType::Psk,
            psk_identity: Some("other".into()),
            ..PeerInfo::unencrypted("127.0.0.1")
        };
        assert_eq!(
            proxy_permission(&record, &psk),
            Err("connection of type \"psk\" is not allowed for proxy \"edge\"".to_string())
        );
        record.tls_accept = TlsAccept::ANY;
        record.psk_identity = Some("edge-psk".into());
        assert_eq!(
            proxy_permission(&record, &psk),
            Err("proxy \"edge\" is using false PSK identity".to_string())
        );
    }

    #[test]
    fn server_policy_rejects_unknown_servers() {
        let policy = ServerPolicy {
            servers: vec!["192.168.1.1".into()],
            ..ServerPolicy::default()
        };
        let stranger = PeerInfo::unencrypted("192.168.1.2");
        assert_eq!(
            policy.check("proxy data", &stranger),
            Err("connection is not allowed".to_string())
        );
        let cert = PeerInfo {
            connection: ConnectionType::Cert,
            ..PeerInfo::unencrypted("192.168.1.1")
        };
        assert_eq!(
            policy.check("proxy data", &cert),
            Err("proxy data over connection of type \"cert\" is not allowed".to_string())
        );
        let open = ServerPolicy {
            tls_accept: TlsAccept::ANY,
            tls_issuer: Some("CA".into()),
            ..ServerPolicy::default()
        };
        assert_eq!(
            open.check("proxy config", &cert),
            Err("certificate issuer or subject mismatch".to_string())
        );
    }
}

//! Outbound connections: the ordered address list, redirect handling and the
//! one-shot request/response exchange built on top of them.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use proxy_wire::tags::field;
use proxy_wire::{json, read_frame, write_frame, Envelope, FrameError, ResponseStatus};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, ExchangeResult, Stage};

pub const DEFAULT_SERVER_PORT: u16 = 10051;

/// One place a peer may be reached. Revision 0 is a statically configured
/// address; anything else came from a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressCandidate {
    pub host: String,
    pub port: u16,
    pub revision: u64,
}

impl AddressCandidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            revision: 0,
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.revision != 0
    }
}

impl fmt::Display for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Splits `host[:port]`, `[v6][:port]` or a bare IPv6 literal.
pub fn parse_endpoint(input: &str, default_port: u16) -> Option<(String, u16)> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }

    match input.matches(':').count() {
        0 => Some((input.to_string(), default_port)),
        1 => {
            let (host, port) = input.split_once(':')?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => Some((input.to_string(), default_port)),
    }
}

/// Instruction from a peer to talk to somebody else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectDirective {
    /// Drop the redirected address and go back to the configured ones.
    Reset,
    Address { revision: u64, host: String, port: u16 },
}

impl RedirectDirective {
    /// Redirect carried by a failed response, if it is well formed.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        if envelope.status() != Some(ResponseStatus::Failed) {
            return None;
        }
        envelope.field(field::REDIRECT).and_then(Self::parse)
    }

    pub fn parse(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object
            .get(field::RESET)
            .and_then(json::as_bool)
            .unwrap_or(false)
        {
            return Some(RedirectDirective::Reset);
        }

        let revision = json::get_u64(object, field::REVISION).filter(|r| *r != 0)?;
        let address = json::get_text(object, field::ADDRESS)?;
        let (host, port) = parse_endpoint(&address, DEFAULT_SERVER_PORT)?;
        Some(RedirectDirective::Address {
            revision,
            host,
            port,
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            RedirectDirective::Reset => json!({ "reset": "true" }),
            RedirectDirective::Address {
                revision,
                host,
                port,
            } => {
                let address = AddressCandidate::new(host.clone(), *port).to_string();
                json!({ "revision": revision, "address": address })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// The list changed; retry against the new first entry.
    Applied,
    /// Older than the redirect already known; retry without touching the list.
    Stale,
    /// Nothing to act on.
    Ignored,
}

/// Failover-ordered list of addresses for one outbound connection. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressList {
    entries: VecDeque<AddressCandidate>,
}

impl AddressList {
    pub fn new(first: AddressCandidate) -> Self {
        Self {
            entries: VecDeque::from([first]),
        }
    }

    pub fn from_candidates(candidates: impl IntoIterator<Item = AddressCandidate>) -> ExchangeResult<Self> {
        let entries: VecDeque<_> = candidates.into_iter().collect();
        if entries.is_empty() {
            return Err(ExchangeError::Config("address list is empty".to_string()));
        }
        Ok(Self { entries })
    }

    /// Parses a comma separated `host[:port]` list.
    pub fn parse(list: &str, default_port: u16) -> ExchangeResult<Self> {
        let candidates = list
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                parse_endpoint(part, default_port)
                    .map(|(host, port)| AddressCandidate::new(host, port))
                    .ok_or_else(|| ExchangeError::Config(format!("invalid address \"{}\"", part.trim())))
            })
            .collect::<ExchangeResult<Vec<_>>>()?;
        Self::from_candidates(candidates)
    }

    pub fn first(&self) -> &AddressCandidate {
        // The constructors reject empty lists and nothing removes the last entry.
        &self.entries[0]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressCandidate> {
        self.entries.iter()
    }

    /// Moves the first address to the back.
    pub fn failover(&mut self) {
        self.entries.rotate_left(1);
    }

    pub fn known_redirect_revision(&self) -> Option<u64> {
        self.entries
            .iter()
            .find(|candidate| candidate.is_redirect())
            .map(|candidate| candidate.revision)
    }

    pub fn apply_redirect(&mut self, directive: &RedirectDirective) -> RedirectOutcome {
        match directive {
            RedirectDirective::Reset => {
                if !self.first().is_redirect() {
                    return RedirectOutcome::Ignored;
                }
                self.failover();
                RedirectOutcome::Applied
            }
            RedirectDirective::Address {
                revision,
                host,
                port,
            } => {
                if matches!(self.known_redirect_revision(), Some(known) if *revision < known) {
                    return RedirectOutcome::Stale;
                }
                self.entries.retain(|candidate| !candidate.is_redirect());
                self.entries.push_front(AddressCandidate {
                    host: host.clone(),
                    port: *port,
                    revision: *revision,
                });
                RedirectOutcome::Applied
            }
        }
    }
}

/// Response to one exchange together with where it came from.
#[derive(Debug, Clone)]
pub struct ExchangeReply {
    pub envelope: Envelope,
    /// The peer compressed its reply.
    pub compressed: bool,
    pub address: AddressCandidate,
}

/// Sends `request` and reads the reply, following at most one redirect.
///
/// Connection attempts fail over through the whole list. The retry after a
/// redirect only tries the new first address. Without `expect_reply` a
/// failure to read a reply counts as the peer closing the connection.
pub async fn exchange(
    addresses: &mut AddressList,
    request: &Envelope,
    config: &ExchangeConfig,
    expect_reply: bool,
) -> ExchangeResult<Option<ExchangeReply>> {
    Ok(round_trip(addresses, request, config, expect_reply)
        .await?
        .map(|open| open.reply))
}

/// Like [`exchange`], but keeps the connection open so the caller can answer
/// the reply. Passive proxies wait for that answer before advancing cursors.
pub async fn exchange_open(
    addresses: &mut AddressList,
    request: &Envelope,
    config: &ExchangeConfig,
) -> ExchangeResult<OpenExchange> {
    match round_trip(addresses, request, config, true).await? {
        Some(open) => Ok(open),
        None => Err(ExchangeError::Protocol("no reply received".to_string())),
    }
}

/// A completed round trip whose connection is still open.
pub struct OpenExchange {
    pub reply: ExchangeReply,
    stream: TcpStream,
    config: ExchangeConfig,
}

impl OpenExchange {
    /// Sends the final acknowledgement and closes the connection.
    pub async fn acknowledge(mut self, envelope: &Envelope) -> ExchangeResult<()> {
        let target = self.reply.address.to_string();
        let frame = self.config.frame();
        let payload = envelope.encode()?;
        with_timeout(
            Stage::Send,
            &target,
            self.config.timeout,
            write_frame(&mut self.stream, &payload, &frame),
        )
        .await
    }
}

async fn round_trip(
    addresses: &mut AddressList,
    request: &Envelope,
    config: &ExchangeConfig,
    expect_reply: bool,
) -> ExchangeResult<Option<OpenExchange>> {
    let payload = request.encode()?;
    let frame = config.frame();
    let mut redirected = false;

    loop {
        let (mut stream, address) = if redirected {
            let address = addresses.first().clone();
            (connect(&address, config.timeout).await?, address)
        } else {
            connect_with_failover(addresses, config).await?
        };
        let target = address.to_string();

        with_timeout(Stage::Send, &target, config.timeout, write_frame(&mut stream, &payload, &frame))
            .await?;

        let received =
            with_timeout(Stage::Recv, &target, config.timeout, read_frame(&mut stream, &frame)).await;
        let reply = match received {
            Ok(reply) => reply,
            Err(err) if !expect_reply => {
                debug!(peer = %target, error = %err, "peer closed connection without reply");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let envelope = Envelope::decode(&reply.payload)?;
        if let Some(directive) = RedirectDirective::from_envelope(&envelope) {
            drop(stream);
            if redirected {
                counter!("proxy_exchange_redirects_total", 1, "outcome" => "sequential");
                return Err(ExchangeError::SequentialRedirect);
            }
            match addresses.apply_redirect(&directive) {
                RedirectOutcome::Applied => {
                    counter!("proxy_exchange_redirects_total", 1, "outcome" => "applied");
                    debug!(peer = %target, to = %addresses.first(), "following redirect");
                }
                RedirectOutcome::Stale => {
                    counter!("proxy_exchange_redirects_total", 1, "outcome" => "stale");
                    debug!(peer = %target, "ignoring stale redirect revision, retrying");
                }
                RedirectOutcome::Ignored => {
                    return Err(ExchangeError::Rejected {
                        info: envelope.info.unwrap_or_default(),
                    });
                }
            }
            redirected = true;
            continue;
        }

        return Ok(Some(OpenExchange {
            reply: ExchangeReply {
                envelope,
                compressed: reply.compressed(),
                address,
            },
            stream,
            config: config.clone(),
        }));
    }
}

/// Tries each address in order, rotating failures to the back. With a
/// reconnect interval configured the rounds repeat until one succeeds.
pub async fn connect_with_failover(
    addresses: &mut AddressList,
    config: &ExchangeConfig,
) -> ExchangeResult<(TcpStream, AddressCandidate)> {
    loop {
        let mut last_error = None;
        for _ in 0..addresses.len() {
            let address = addresses.first().clone();
            match connect(&address, config.timeout).await {
                Ok(stream) => return Ok((stream, address)),
                Err(err) => {
                    debug!(peer = %address, error = %err, "connection attempt failed");
                    addresses.failover();
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| ExchangeError::Config("address list is empty".to_string()));
        match config.reconnect_interval {
            Some(interval) => {
                warn!(error = %err, retry_in = ?interval, "all addresses unreachable");
                tokio::time::sleep(interval).await;
            }
            None => return Err(err),
        }
    }
}

async fn connect(address: &AddressCandidate, timeout: Duration) -> ExchangeResult<TcpStream> {
    let target = address.to_string();
    match tokio::time::timeout(timeout, TcpStream::connect((address.host.as_str(), address.port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(ExchangeError::Connect {
            address: target,
            reason: err.to_string(),
        }),
        Err(_) => Err(ExchangeError::Timeout {
            stage: Stage::Connect,
            address: target,
        }),
    }
}

pub(crate) async fn with_timeout<T, F>(stage: Stage, address: &str, timeout: Duration, fut: F) -> ExchangeResult<T>
where
    F: Future<Output = Result<T, FrameError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|err| ExchangeError::from_frame(stage, address, err)),
        Err(_) => Err(ExchangeError::Timeout {
            stage,
            address: address.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[(&str, u64)]) -> AddressList {
        AddressList::from_candidates(entries.iter().map(|(host, revision)| AddressCandidate {
            host: host.to_string(),
            port: DEFAULT_SERVER_PORT,
            revision: *revision,
        }))
        .expect("non-empty")
    }

    fn hosts(list: &AddressList) -> Vec<(String, u64)> {
        list.iter().map(|c| (c.host.clone(), c.revision)).collect()
    }

    #[test]
    fn endpoints_parse_with_default_port() {
        assert_eq!(parse_endpoint("10.0.0.9:10052", 10051), Some(("10.0.0.9".into(), 10052)));
        assert_eq!(parse_endpoint("server", 10051), Some(("server".into(), 10051)));
        assert_eq!(parse_endpoint("[::1]:99", 10051), Some(("::1".into(), 99)));
        assert_eq!(parse_endpoint("fe80::1", 10051), Some(("fe80::1".into(), 10051)));
        assert_eq!(parse_endpoint("host:port", 10051), None);
        assert_eq!(parse_endpoint("", 10051), None);
    }

    #[test]
    fn address_list_parses_comma_separated() {
        let parsed = AddressList::parse("a:1, b ,[::1]:3", 10051).expect("parse");
        assert_eq!(
            parsed.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["a:1", "b:10051", "[::1]:3"]
        );
        assert!(AddressList::parse(" , ", 10051).is_err());
    }

    #[test]
    fn redirect_directives_parse_from_failed_responses() {
        let envelope = Envelope::failed("moved")
            .with_field(field::REDIRECT, json!({"revision": 5, "address": "10.0.0.9:10051"}));
        assert_eq!(
            RedirectDirective::from_envelope(&envelope),
            Some(RedirectDirective::Address {
                revision: 5,
                host: "10.0.0.9".into(),
                port: 10051
            })
        );

        let reset = Envelope::failed("reset").with_field(field::REDIRECT, json!({"reset": "true"}));
        assert_eq!(RedirectDirective::from_envelope(&reset), Some(RedirectDirective::Reset));

        let success = Envelope::success().with_field(field::REDIRECT, json!({"reset": true}));
        assert_eq!(RedirectDirective::from_envelope(&success), None);

        let no_revision = Envelope::failed("x").with_field(field::REDIRECT, json!({"address": "a"}));
        assert_eq!(RedirectDirective::from_envelope(&no_revision), None);
    }

    #[test]
    fn directive_json_is_parseable_back() {
        let directive = RedirectDirective::Address {
            revision: 7,
            host: "::1".into(),
            port: 10051,
        };
        assert_eq!(directive.to_json(), json!({"revision": 7, "address": "[::1]:10051"}));
        assert_eq!(RedirectDirective::parse(&directive.to_json()), Some(directive));
    }

    #[test]
    fn new_redirect_goes_to_front_and_replaces_older_redirects() {
        let mut addresses = list(&[("a", 0), ("old", 3), ("b", 0)]);
        let outcome = addresses.apply_redirect(&RedirectDirective::Address {
            revision: 5,
            host: "new".into(),
            port: 10051,
        });
        assert_eq!(outcome, RedirectOutcome::Applied);
        assert_eq!(
            hosts(&addresses),
            vec![("new".into(), 5), ("a".into(), 0), ("b".into(), 0)]
        );
    }

    #[test]
    fn stale_redirect_never_mutates_the_list() {
        for stale in 1..5 {
            let mut addresses = list(&[("r", 5), ("a", 0)]);
            let before = addresses.clone();
            let outcome = addresses.apply_redirect(&RedirectDirective::Address {
                revision: stale,
                host: "elsewhere".into(),
                port: 1,
            });
            assert_eq!(outcome, RedirectOutcome::Stale);
            assert_eq!(addresses, before);
        }
    }

    #[test]
    fn reset_only_applies_to_redirected_first_address() {
        let mut addresses = list(&[("a", 0), ("b", 0)]);
        assert_eq!(addresses.apply_redirect(&RedirectDirective::Reset), RedirectOutcome::Ignored);
        assert_eq!(hosts(&addresses)[0].0, "a");

        let mut addresses = list(&[("r", 4), ("a", 0)]);
        assert_eq!(addresses.apply_redirect(&RedirectDirective::Reset), RedirectOutcome::Applied);
        assert_eq!(hosts(&addresses), vec![("a".into(), 0), ("r".into(), 4)]);
    }
}

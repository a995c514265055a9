//! Requests from agents and senders, served by every role.

use async_trait::async_trait;
use proxy_wire::tags::field;
use proxy_wire::{json, parse_version, Envelope, RemoteVersion, Version};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Connection, Handler, Request};
use crate::collab::HostLookup;
use crate::connection::RedirectDirective;
use crate::context::{ExchangeContext, ProgramType};
use crate::error::ExchangeResult;
use crate::ingest::{check_session_token, process_history_by_itemids, process_history_by_keys, Validator};
use crate::session::SessionType;

/// Agents that omit their version are treated as this one.
const DEFAULT_AGENT_VERSION: Version = Version::new(4, 2, 0);

/// First agent version that names its host in the envelope and sends item ids.
const ITEMID_AGENT_VERSION: Version = Version::new(4, 4, 0);

pub(super) fn redirect_response(directive: &RedirectDirective) -> Envelope {
    Envelope::failed("host is served by another node").with_field(field::REDIRECT, directive.to_json())
}

pub struct AgentData;

#[async_trait]
impl Handler for AgentData {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let envelope = &request.envelope;
        let Some(rows) = envelope.field_array(field::DATA) else {
            return conn.send(&Envelope::success()).await;
        };

        let token = match check_session_token(envelope.field_text(field::SESSION)) {
            Ok(token) => token,
            Err(info) => return reject_agent(conn, info).await,
        };

        let version = match envelope.version.as_deref().map(parse_version) {
            Some(Ok(RemoteVersion::Known(version))) => version,
            _ => DEFAULT_AGENT_VERSION,
        };
        let keyed = version < ITEMID_AGENT_VERSION;

        let host = if keyed {
            let Some(first) = rows.first() else {
                return conn.send(&Envelope::success()).await;
            };
            let Some(row) = first.as_object() else {
                return reject_agent(conn, "cannot open \"data\" token".to_string()).await;
            };
            match json::get_text(row, field::HOST) {
                Some(host) => host,
                None => return reject_agent(conn, "cannot find \"host\" token in data".to_string()).await,
            }
        } else {
            match envelope.field_text(field::HOST) {
                Some(host) => host,
                None => return reject_agent(conn, "cannot find \"host\" token".to_string()).await,
            }
        };

        let hostid = match ctx.services.config.host_by_name(&host, &conn.peer).await {
            HostLookup::Found(hostid) => hostid,
            HostLookup::Unknown => {
                return conn
                    .send(&Envelope::success().with_info(format!("unknown host '{host}'")))
                    .await;
            }
            HostLookup::Redirect(directive) => return conn.send(&redirect_response(&directive)).await,
        };

        let counts = if keyed {
            process_history_by_keys(ctx, rows, token.as_deref(), Validator::Agent, request.received).await
        } else {
            let session = token
                .as_deref()
                .map(|token| ctx.sessions.get_or_create(hostid, token, SessionType::Data));
            process_history_by_itemids(ctx, rows, session.as_ref(), Validator::Agent, request.received).await
        };
        debug!(peer = %conn.peer.address, host = %host, "{counts}");
        conn.send(&Envelope::success().with_info(counts.info())).await
    }
}

async fn reject_agent(conn: &mut Connection, info: String) -> ExchangeResult<()> {
    warn!("received invalid agent history data from \"{}\": {info}", conn.peer.address);
    conn.send(&Envelope::failed(info)).await
}

pub struct SenderData;

#[async_trait]
impl Handler for SenderData {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let Some(rows) = request.envelope.field_array(field::DATA) else {
            let info = "cannot open \"data\" token";
            warn!("cannot process sender data from \"{}\": {info}", conn.peer.address);
            return conn.send(&Envelope::failed(info)).await;
        };

        let first_host = rows
            .first()
            .and_then(Value::as_object)
            .and_then(|row| json::get_text(row, field::HOST));
        if let Some(host) = first_host {
            if let HostLookup::Redirect(directive) = ctx.services.config.host_by_name(&host, &conn.peer).await {
                return conn.send(&redirect_response(&directive)).await;
            }
        }

        let counts = process_history_by_keys(
            ctx,
            rows,
            None,
            Validator::Sender { peer: &conn.peer },
            request.received,
        )
        .await;
        conn.send(&Envelope::success().with_info(counts.info())).await
    }
}

pub struct ActiveChecks;

#[async_trait]
impl Handler for ActiveChecks {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let Some(host) = request.envelope.field_text(field::HOST) else {
            return conn.send(&Envelope::failed("cannot find \"host\" token")).await;
        };
        match ctx.services.config.host_by_name(&host, &conn.peer).await {
            HostLookup::Redirect(directive) => return conn.send(&redirect_response(&directive)).await,
            HostLookup::Unknown => {
                warn!("cannot send list of active checks to \"{}\": host [{host}] not found", conn.peer.address);
                return conn.send(&Envelope::failed(format!("host [{host}] not found"))).await;
            }
            HostLookup::Found(_) => {}
        }

        match ctx.services.config.active_checks(&host).await {
            Ok(checks) => {
                let data = serde_json::to_value(&checks).unwrap_or(Value::Array(Vec::new()));
                conn.send(&Envelope::success().with_field(field::DATA, data)).await
            }
            Err(err) => conn.send(&Envelope::failed(err.to_string())).await,
        }
    }
}

pub struct ActiveCheckHeartbeat;

#[async_trait]
impl Handler for ActiveCheckHeartbeat {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let envelope = &request.envelope;
        let Some(host) = envelope.field_text(field::HOST) else {
            warn!("cannot process active check heartbeat from \"{}\": cannot find \"host\" token", conn.peer.address);
            return Ok(());
        };
        let hostid = match ctx.services.config.host_by_name(&host, &conn.peer).await {
            HostLookup::Found(hostid) => hostid,
            HostLookup::Redirect(directive) => return conn.send(&redirect_response(&directive)).await,
            HostLookup::Unknown => return Ok(()),
        };
        if ctx.role == ProgramType::Server && ctx.services.config.host_proxy(hostid).await.is_some() {
            return Ok(());
        }

        let Some(frequency) = envelope.field_i64(field::HEARTBEAT_FREQ) else {
            warn!(
                "cannot process active check heartbeat from \"{}\": cannot find \"heartbeat_freq\" token",
                conn.peer.address
            );
            return Ok(());
        };
        ctx.services
            .availability
            .active_heartbeat(hostid, frequency)
            .await
            .map_err(Into::into)
    }
}

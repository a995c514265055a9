//! Requests only a server answers: active proxy traffic and frontend calls.

use async_trait::async_trait;
use proxy_wire::tags::field;
use proxy_wire::{Compatibility, Envelope, MoreFlag, RemoteVersion};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Connection, Handler, Request};
use crate::collab::{ProxyRecord, UserRole};
use crate::context::{require_supported, ExchangeContext};
use crate::error::{ExchangeError, ExchangeResult};
use crate::ingest::{
    check_session_token, process_autoreg, process_discovery, process_history_by_itemids, process_interfaces,
    process_proxy_data, Validator,
};
use crate::record::Stream;
use crate::session::SessionType;

const PERMISSION_DENIED: &str = "Permission denied.";

/// Resolves the sending proxy; on failure answers and logs, returning `None`.
async fn identify(ctx: &ExchangeContext, conn: &mut Connection, request: &Request) -> ExchangeResult<Option<ProxyRecord>> {
    let name = request.envelope.field_text(field::HOST);
    match ctx.active_proxy(name.as_deref(), &conn.peer).await {
        Ok(proxy) => Ok(Some(proxy)),
        Err(err) => {
            warn!(
                "cannot process {} request from active proxy at \"{}\": {err}",
                request.tag, conn.peer.address
            );
            conn.send(&Envelope::failed(err.to_string())).await?;
            Ok(None)
        }
    }
}

/// Classifies the proxy version; answers with the failure when it may not proceed.
async fn compatible(
    ctx: &ExchangeContext,
    conn: &mut Connection,
    proxy: &ProxyRecord,
    request: &Request,
) -> ExchangeResult<Option<(RemoteVersion, Compatibility)>> {
    let classified = ctx.classify_proxy_version(&proxy.name, request.envelope.version.as_deref());
    match require_supported(classified) {
        Ok(version) => Ok(Some(version)),
        Err(err) => {
            ctx.record_proxy_access(proxy, Some(classified), request.compressed).await;
            conn.send(&Envelope::failed(err.to_string()).with_version(ctx.version)).await?;
            Ok(None)
        }
    }
}

pub struct ServeProxyConfig;

#[async_trait]
impl Handler for ServeProxyConfig {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let Some(proxy) = identify(ctx, conn, &request).await? else {
            return Ok(());
        };
        let version = ctx.classify_proxy_version(&proxy.name, request.envelope.version.as_deref());
        let version = match version {
            (_, Compatibility::Current) => version,
            other => {
                ctx.record_proxy_access(&proxy, Some(other), request.compressed).await;
                let info = "proxy and server major versions do not match";
                warn!("cannot send configuration data to proxy \"{}\" at \"{}\": {info}", proxy.name, conn.peer.address);
                return conn.send(&Envelope::failed(info).with_version(ctx.version)).await;
            }
        };

        match ctx.services.config.proxy_config(&proxy).await {
            Ok(config) => {
                let reply = Envelope::success()
                    .with_version(ctx.version)
                    .with_field(field::DATA, config);
                conn.send_compressed(&reply).await?;
                ctx.record_proxy_access(&proxy, Some(version), request.compressed).await;
                debug!(proxy = %proxy.name, "sent configuration data");
                Ok(())
            }
            Err(err) => {
                warn!("cannot collect configuration data for proxy \"{}\": {err}", proxy.name);
                conn.send(&Envelope::failed(err.to_string())).await
            }
        }
    }
}

pub struct ReceiveProxyData;

#[async_trait]
impl Handler for ReceiveProxyData {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let Some(proxy) = identify(ctx, conn, &request).await? else {
            return Ok(());
        };
        let Some(version) = compatible(ctx, conn, &proxy, &request).await? else {
            return Ok(());
        };

        let outcome = process_proxy_data(ctx, &proxy, &request.envelope, request.received).await;
        if let Some(error) = &outcome.error {
            warn!(
                "received invalid proxy data from proxy \"{}\" at \"{}\": {error}",
                proxy.name, conn.peer.address
            );
        }

        let mut reply = outcome.response().with_version(ctx.version);
        let mut handed_over = Vec::new();
        if outcome.error.is_none() {
            let tasks = ctx.services.tasks.pending_for_proxy(proxy.proxyid).await?;
            if !tasks.is_empty() {
                handed_over = tasks.iter().map(|task| task.taskid).collect();
                let tasks = serde_json::to_value(&tasks).map_err(|err| ExchangeError::Protocol(err.to_string()))?;
                reply.set_field(field::TASKS, tasks);
            }
        }
        conn.send(&reply).await?;
        if !handed_over.is_empty() {
            ctx.services.tasks.mark_in_progress(&handed_over).await?;
        }

        ctx.record_proxy_access(&proxy, Some(version), request.compressed).await;
        let mut runtime = ctx.services.config.proxy_runtime(proxy.proxyid).await;
        runtime.more = outcome.more == MoreFlag::More;
        runtime.proxy_delay = outcome.proxy_delay;
        ctx.services.config.update_proxy_runtime(proxy.proxyid, runtime).await;
        Ok(())
    }
}

/// Single-stream uploads from proxies that predate `proxy data`.
pub struct ReceiveStream(pub Stream);

#[async_trait]
impl Handler for ReceiveStream {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let Some(proxy) = identify(ctx, conn, &request).await? else {
            return Ok(());
        };
        let Some(version) = compatible(ctx, conn, &proxy, &request).await? else {
            return Ok(());
        };
        let rows: &[Value] = request
            .envelope
            .field_array(field::DATA)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let result = match self.0 {
            Stream::History => match check_session_token(request.envelope.field_text(field::SESSION)) {
                Ok(token) => {
                    let session = token
                        .as_deref()
                        .map(|token| ctx.sessions.get_or_create(proxy.proxyid, token, SessionType::Data));
                    Ok(process_history_by_itemids(
                        ctx,
                        rows,
                        session.as_ref(),
                        Validator::Proxy {
                            proxyid: proxy.proxyid,
                        },
                        request.received,
                    )
                    .await)
                }
                Err(err) => Err(err),
            },
            Stream::Discovery => process_discovery(ctx, Some(proxy.proxyid), rows).await,
            Stream::Autoreg => process_autoreg(ctx, Some(proxy.proxyid), rows).await,
        };

        ctx.record_proxy_access(&proxy, Some(version), request.compressed).await;
        match result {
            Ok(counts) => conn.send(&Envelope::success().with_info(counts.info())).await,
            Err(error) => {
                warn!(
                    "received invalid {} from proxy \"{}\" at \"{}\": {error}",
                    request.tag, proxy.name, conn.peer.address
                );
                conn.send(&Envelope::failed(error)).await
            }
        }
    }
}

pub struct ReceiveAvailability;

#[async_trait]
impl Handler for ReceiveAvailability {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let Some(proxy) = identify(ctx, conn, &request).await? else {
            return Ok(());
        };
        let rows = request
            .envelope
            .field_array(field::DATA)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let reply = match process_interfaces(ctx, rows).await {
            Ok(()) => Envelope::success(),
            Err(error) => {
                warn!(
                    "received invalid host availability data from proxy \"{}\" at \"{}\": {error}",
                    proxy.name, conn.peer.address
                );
                Envelope::failed(error)
            }
        };
        conn.send(&reply).await
    }
}

pub struct ProxyHeartbeat;

#[async_trait]
impl Handler for ProxyHeartbeat {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let name = request.envelope.field_text(field::HOST);
        let proxy = match ctx.active_proxy(name.as_deref(), &conn.peer).await {
            Ok(proxy) => proxy,
            Err(err) => {
                warn!("cannot parse heartbeat from active proxy at \"{}\": {err}", conn.peer.address);
                return Ok(());
            }
        };
        debug!(
            "ignoring heartbeat from active proxy \"{}\" at \"{}\": deprecated",
            proxy.name, conn.peer.address
        );
        let version = ctx.classify_proxy_version(&proxy.name, request.envelope.version.as_deref());
        ctx.record_proxy_access(&proxy, Some(version), request.compressed).await;
        Ok(())
    }
}

/// Runs a frontend script on behalf of a logged-in user.
pub struct Command;

#[async_trait]
impl Handler for Command {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        if session_role(ctx, &request).await.is_none() {
            return conn.send(&Envelope::failed(PERMISSION_DENIED)).await;
        }
        let fields: Map<String, Value> = request
            .envelope
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let reply = match ctx.services.tasks.run_command(&fields).await {
            Ok(output) => Envelope::success().with_field(field::DATA, output),
            Err(err) => Envelope::failed(err.to_string()),
        };
        conn.send(&reply).await
    }
}

pub struct GetQueue;

#[async_trait]
impl Handler for GetQueue {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        if session_role(ctx, &request).await != Some(UserRole::SuperAdmin) {
            return conn.send(&Envelope::failed(PERMISSION_DENIED)).await;
        }
        let queue = ctx.services.config.queue_overview().await;
        conn.send(&Envelope::success().with_field(field::DATA, queue)).await
    }
}

async fn session_role(ctx: &ExchangeContext, request: &Request) -> Option<UserRole> {
    let sid = request.envelope.field_text(field::SID)?;
    ctx.services.access.session_role(&sid).await
}

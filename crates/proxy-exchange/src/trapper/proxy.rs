//! Requests a proxy answers when the server polls it.

use async_trait::async_trait;
use proxy_wire::tags::field;
use proxy_wire::Envelope;
use tracing::{debug, warn};

use super::{Connection, Handler, Request};
use crate::batch::{assemble, BatchContents};
use crate::clock::timespec_now;
use crate::context::ExchangeContext;
use crate::error::ExchangeResult;
use crate::ingest::{parse_array, IngestCounts};
use crate::record::TaskRecord;

pub struct InstallProxyConfig;

#[async_trait]
impl Handler for InstallProxyConfig {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, mut request: Request) -> ExchangeResult<()> {
        if let Err(reason) = ctx.check_server_access(request.tag.as_str(), &conn.peer) {
            return conn.send(&Envelope::failed(reason)).await;
        }
        let Some(config) = request.envelope.take_field(field::DATA) else {
            let info = "cannot find \"data\" tag";
            warn!("cannot process configuration data from server at \"{}\": {info}", conn.peer.address);
            return conn.send(&Envelope::failed(info)).await;
        };

        let reply = match ctx.services.config.install_proxy_config(config).await {
            Ok(()) => {
                debug!(server = %conn.peer.address, "installed configuration data");
                Envelope::success().with_version(ctx.version)
            }
            Err(err) => {
                warn!("cannot install configuration data from server at \"{}\": {err}", conn.peer.address);
                Envelope::failed(err.to_string())
            }
        };
        conn.send(&reply).await
    }
}

/// Answers a server pull with staged data, committing progress only after the
/// server acknowledges it.
pub struct SendProxyData(pub BatchContents);

#[async_trait]
impl Handler for SendProxyData {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        if ctx.check_server_access(request.tag.as_str(), &conn.peer).is_err() {
            return Ok(());
        }

        if let Some(rows) = request.envelope.field_array(field::TASKS) {
            let mut counts = IngestCounts::new();
            let tasks: Vec<TaskRecord> = parse_array(rows, &mut counts);
            if !tasks.is_empty() {
                ctx.services.tasks.save_received(None, tasks).await?;
            }
        }

        let (reply, pending) = {
            let _guard = ctx.services.staging_lock.lock().await;
            let now = timespec_now();
            let mut reply = Envelope::success()
                .with_version(ctx.version)
                .with_field(field::SESSION, ctx.session_token.clone())
                .with_clock(now.sec, now.ns);
            let pending = assemble(&ctx.services, &ctx.config.limits, self.0, &mut reply).await?;
            (reply, pending)
        };

        conn.send(&reply).await?;

        match conn.receive_envelope().await {
            Ok(ack) if ack.is_success() => {
                if !pending.is_empty() {
                    pending.commit(&ctx.services).await?;
                }
                debug!(server = %conn.peer.address, request = %request.tag, "server acknowledged data");
                Ok(())
            }
            Ok(ack) => {
                let info = ack.info.unwrap_or_default();
                warn!(
                    "sending {} to server \"{}\" failed: {info}",
                    request.tag, conn.peer.address
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "sending {} to server \"{}\" failed: {err}",
                    request.tag, conn.peer.address
                );
                Ok(())
            }
        }
    }
}

/// Answers passive-mode requests reaching a proxy that runs in active mode.
pub struct Misconfigured;

#[async_trait]
impl Handler for Misconfigured {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()> {
        let info = format!(
            "misconfiguration error: the proxy is running in the active mode but server at \"{}\" sends requests to it as to proxy in passive mode",
            conn.peer.address
        );
        if ctx.throttle.first_time(&format!("misconfigured:{}", request.tag)) {
            warn!("{info}");
        }
        conn.send(&Envelope::failed(info)).await
    }
}

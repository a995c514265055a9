//! Inbound request handling: classifies the first message on an accepted
//! connection and routes it to the handler registered for this node's role.

mod agent;
mod legacy;
mod proxy;
mod server;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use proxy_wire::{
    compression_available, read_frame, write_frame, Envelope, EnvelopeError, Frame, FrameConfig, FrameError,
    RequestTag,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::BatchContents;
use crate::clock::{timespec_now, Timespec};
use crate::collab::PeerInfo;
use crate::connection::with_timeout;
use crate::context::{ExchangeContext, ProgramType};
use crate::error::{ExchangeError, ExchangeResult, Stage};
use crate::record::Stream;

pub use legacy::ACTIVE_CHECKS_MARKER;

/// Byte stream a request arrives on.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// An accepted connection with the facts handlers need about its peer.
pub struct Connection {
    stream: Box<dyn PeerStream>,
    pub peer: PeerInfo,
    frame: FrameConfig,
    timeout: Duration,
    /// Replies are compressed once the peer has shown it compresses.
    compress: bool,
}

impl Connection {
    pub fn new(stream: impl PeerStream + 'static, peer: PeerInfo, ctx: &ExchangeContext) -> Self {
        Self {
            stream: Box::new(stream),
            peer,
            frame: ctx.config.listener_frame(),
            timeout: ctx.config.timeout,
            compress: false,
        }
    }

    pub async fn receive(&mut self) -> ExchangeResult<Frame> {
        let frame = with_timeout(
            Stage::Recv,
            &self.peer.address,
            self.timeout,
            read_frame(&mut self.stream, &self.frame),
        )
        .await?;
        self.compress = frame.compressed() && compression_available();
        Ok(frame)
    }

    pub async fn receive_envelope(&mut self) -> ExchangeResult<Envelope> {
        let frame = self.receive().await?;
        Ok(Envelope::decode(&frame.payload)?)
    }

    pub async fn send(&mut self, envelope: &Envelope) -> ExchangeResult<()> {
        let compress = self.compress;
        self.send_with(envelope, compress).await
    }

    /// Sends compressed whenever this build supports it.
    pub async fn send_compressed(&mut self, envelope: &Envelope) -> ExchangeResult<()> {
        self.send_with(envelope, compression_available()).await
    }

    async fn send_with(&mut self, envelope: &Envelope, compress: bool) -> ExchangeResult<()> {
        let config = FrameConfig {
            compress,
            ..self.frame.clone()
        };
        let payload = envelope.encode()?;
        with_timeout(
            Stage::Send,
            &self.peer.address,
            self.timeout,
            write_frame(&mut self.stream, &payload, &config),
        )
        .await
    }

    /// Writes bytes without a header, as the legacy line protocols expect.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> ExchangeResult<()> {
        let address = self.peer.address.clone();
        let stream = &mut self.stream;
        with_timeout(Stage::Send, &address, self.timeout, async move {
            stream.write_all(bytes).await?;
            stream.flush().await?;
            Ok::<(), FrameError>(())
        })
        .await
    }
}

/// One parsed JSON request.
#[derive(Debug, Clone)]
pub struct Request {
    pub tag: RequestTag,
    pub envelope: Envelope,
    /// When the request was read; values without a clock take this time.
    pub received: Timespec,
    pub compressed: bool,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &ExchangeContext, conn: &mut Connection, request: Request) -> ExchangeResult<()>;
}

type Routes = HashMap<RequestTag, Arc<dyn Handler>>;

/// Dispatch table for one node role.
pub struct Dispatcher {
    ctx: Arc<ExchangeContext>,
    routes: Routes,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ExchangeContext>) -> Self {
        let routes = routes_for(ctx.role);
        Self { ctx, routes }
    }

    pub fn context(&self) -> &Arc<ExchangeContext> {
        &self.ctx
    }

    pub fn handles(&self, tag: RequestTag) -> bool {
        self.routes.contains_key(&tag)
    }

    /// Reads one request from `stream` and handles it to completion.
    pub async fn serve(&self, stream: impl PeerStream + 'static, peer: PeerInfo) -> ExchangeResult<()> {
        let mut conn = Connection::new(stream, peer, &self.ctx);
        let frame = conn.receive().await?;
        let result = self.dispatch(&mut conn, frame).await;
        if let Err(err) = &result {
            counter!("proxy_exchange_failures_total", 1, "kind" => err.kind().as_str());
        }
        result
    }

    pub async fn dispatch(&self, conn: &mut Connection, frame: Frame) -> ExchangeResult<()> {
        let received = timespec_now();
        let compressed = frame.compressed();
        let payload = trim_end(&frame.payload);
        let max_size = self.ctx.config.limits.max_recv_size;

        if payload.first() == Some(&b'{') {
            let envelope = match Envelope::decode(payload) {
                Ok(envelope) => envelope,
                Err(EnvelopeError::MissingTag(tag)) => {
                    debug!(peer = %conn.peer.address, "request without \"{tag}\" tag ignored");
                    return Ok(());
                }
                Err(err) => {
                    warn!("received invalid JSON object from {}: {err}", conn.peer.address);
                    return conn.send(&Envelope::failed(err.to_string())).await;
                }
            };
            let Some(tag_text) = envelope.request_str().map(str::to_string) else {
                debug!(peer = %conn.peer.address, "response received where a request was expected");
                return Ok(());
            };

            if payload.len() as u64 > max_size && tag_text != RequestTag::ProxyConfig.as_str() {
                warn!(
                    "message size {} exceeds the maximum size {max_size} for request \"{tag_text}\" received from \"{}\"",
                    payload.len(),
                    conn.peer.address
                );
                return Ok(());
            }

            let Some(tag) = RequestTag::lookup(&tag_text) else {
                warn!("unknown request received from \"{}\": [{tag_text}]", conn.peer.address);
                return Ok(());
            };
            let Some(handler) = self.routes.get(&tag) else {
                debug!(
                    peer = %conn.peer.address,
                    role = %self.ctx.role,
                    "request \"{tag}\" is not handled by this node"
                );
                return Ok(());
            };
            let request = Request {
                tag,
                envelope,
                received,
                compressed,
            };
            return handler.handle(&self.ctx, conn, request).await;
        }

        if payload.starts_with(ACTIVE_CHECKS_MARKER) {
            return legacy::active_checks(&self.ctx, conn, payload).await;
        }

        if payload.len() as u64 > max_size {
            warn!(
                "message size {} exceeds the maximum size {max_size} for XML protocol received from \"{}\"",
                payload.len(),
                conn.peer.address
            );
            return Ok(());
        }
        legacy::single_value(&self.ctx, conn, payload, received).await
    }
}

fn routes_for(role: ProgramType) -> Routes {
    let mut routes: Routes = HashMap::new();
    routes.insert(RequestTag::AgentData, Arc::new(agent::AgentData));
    routes.insert(RequestTag::SenderData, Arc::new(agent::SenderData));
    routes.insert(RequestTag::GetActiveChecks, Arc::new(agent::ActiveChecks));
    routes.insert(RequestTag::ActiveCheckHeartbeat, Arc::new(agent::ActiveCheckHeartbeat));

    match role {
        ProgramType::Server => {
            routes.insert(RequestTag::ProxyConfig, Arc::new(server::ServeProxyConfig));
            routes.insert(RequestTag::ProxyData, Arc::new(server::ReceiveProxyData));
            routes.insert(RequestTag::HistoryData, Arc::new(server::ReceiveStream(Stream::History)));
            routes.insert(RequestTag::DiscoveryData, Arc::new(server::ReceiveStream(Stream::Discovery)));
            routes.insert(RequestTag::AutoRegistration, Arc::new(server::ReceiveStream(Stream::Autoreg)));
            routes.insert(RequestTag::HostAvailability, Arc::new(server::ReceiveAvailability));
            routes.insert(RequestTag::ProxyHeartbeat, Arc::new(server::ProxyHeartbeat));
            routes.insert(RequestTag::Command, Arc::new(server::Command));
            routes.insert(RequestTag::GetQueue, Arc::new(server::GetQueue));
        }
        ProgramType::ProxyPassive => {
            routes.insert(RequestTag::ProxyConfig, Arc::new(proxy::InstallProxyConfig));
            routes.insert(RequestTag::ProxyData, Arc::new(proxy::SendProxyData(BatchContents::PROXY_DATA)));
            routes.insert(RequestTag::ProxyTasks, Arc::new(proxy::SendProxyData(BatchContents::TASKS)));
            routes.insert(
                RequestTag::HistoryData,
                Arc::new(proxy::SendProxyData(BatchContents::only(Stream::History))),
            );
            routes.insert(
                RequestTag::DiscoveryData,
                Arc::new(proxy::SendProxyData(BatchContents::only(Stream::Discovery))),
            );
            routes.insert(
                RequestTag::AutoRegistration,
                Arc::new(proxy::SendProxyData(BatchContents::only(Stream::Autoreg))),
            );
            routes.insert(
                RequestTag::HostAvailability,
                Arc::new(proxy::SendProxyData(BatchContents::AVAILABILITY)),
            );
        }
        ProgramType::ProxyActive => {
            for tag in [RequestTag::ProxyConfig, RequestTag::ProxyData, RequestTag::ProxyTasks] {
                routes.insert(tag, Arc::new(proxy::Misconfigured));
            }
        }
    }
    routes
}

fn trim_end(payload: &[u8]) -> &[u8] {
    let end = payload
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\r' | b'\n'))
        .map(|idx| idx + 1)
        .unwrap_or(0);
    &payload[..end]
}

/// Accepts connections until the task is aborted, handling each on its own task.
pub fn spawn_listener(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!(listen_addr = %addr, role = %dispatcher.context().role, "trapper listening");
        }
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    continue;
                }
            };
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let peer = peer_info(addr);
                if let Err(err) = dispatcher.serve(stream, peer).await {
                    log_failure(&addr, &err);
                }
            });
        }
    })
}

fn peer_info(addr: SocketAddr) -> PeerInfo {
    PeerInfo::unencrypted(addr.ip().to_string())
}

fn log_failure(addr: &SocketAddr, err: &ExchangeError) {
    if err.kind().is_retryable() {
        debug!(peer = %addr, error = %err, "connection ended with transport error");
    } else {
        warn!(peer = %addr, error = %err, "failed to handle request");
    }
}

#[cfg(test)]
mod tests;

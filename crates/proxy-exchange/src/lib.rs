//! Proxy/server data exchange: outbound connections with redirects, cursor
//! based batch transfer, session dedup, the trapper request dispatcher and
//! the poll/push loops that move data between proxies and servers.

pub mod batch;
pub mod clock;
pub mod collab;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod ingest;
pub mod memory;
pub mod orchestrator;
pub mod record;
pub mod session;
pub mod store;
pub mod throttle;
pub mod trapper;

pub use batch::{assemble, get_batch, BatchContents, PendingCommit, StreamBatch};
pub use collab::{PeerInfo, ProxyMode, ProxyRecord, Services};
pub use config::{ExchangeConfig, TransferLimits};
pub use connection::{exchange, exchange_open, AddressCandidate, AddressList, RedirectDirective};
pub use context::{ExchangeContext, ProgramType, ServerPolicy, LOCAL_VERSION};
pub use error::{ErrorKind, ExchangeError, ExchangeResult};
pub use memory::MemoryServices;
pub use orchestrator::{ActivePusher, PassivePoller, PollerConfig, PusherConfig};
pub use session::{SessionConfig, SessionRegistry};
pub use store::{MemoryStore, StagingStore};
pub use trapper::{spawn_listener, Dispatcher};

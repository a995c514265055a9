//! Sender side of the cursor transfer: pages staged rows after each stream's
//! cursor into size-bounded arrays, and commits the cursors once the peer
//! acknowledges.

use proxy_wire::tags::field;
use proxy_wire::{Envelope, MoreFlag};
use serde_json::Value;
use tracing::debug;

use crate::clock::unix_now;
use crate::collab::Services;
use crate::config::TransferLimits;
use crate::error::{ExchangeError, ExchangeResult};
use crate::record::{Stream, TaskRecord, TaskStatus};
use crate::store::{Progress, StagingStore, StoreResult};

/// Rows pulled from one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub stream: Stream,
    pub rows: Vec<Value>,
    /// Id of the last row taken; the cursor value to commit on acknowledgement.
    pub last_id: u64,
    pub more: MoreFlag,
    /// Serialized size of `rows`, separators included.
    pub bytes: usize,
}

impl StreamBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Reads rows after the stream's cursor until `budget` bytes are used or the
/// table runs out. The first row is always taken, whatever its size.
///
/// A jump in ids means a writer has not committed yet; the page is re-read
/// once after a short delay and any gap still present is accepted.
pub async fn get_batch(
    store: &dyn StagingStore,
    limits: &TransferLimits,
    stream: Stream,
    budget: usize,
) -> StoreResult<StreamBatch> {
    let cursor = store.last_id(stream.cursor()).await?;
    let mut batch = StreamBatch {
        stream,
        rows: Vec::with_capacity(limits.rows_per_page.min(1024)),
        last_id: cursor,
        more: MoreFlag::Done,
        bytes: 0,
    };
    let mut gap_retried = false;

    loop {
        let page = store
            .rows_after(stream, batch.last_id, limits.rows_per_page)
            .await?;
        if page.is_empty() {
            break;
        }

        let expected = batch.last_id + 1;
        let contiguous = page
            .iter()
            .zip(expected..)
            .all(|(row, id)| row.id == id);
        if !contiguous && !gap_retried && batch.last_id != 0 {
            gap_retried = true;
            debug!(stream = stream.table(), after = batch.last_id, "missing rows, re-reading page");
            tokio::time::sleep(limits.gap_retry_delay).await;
            continue;
        }

        let full_page = page.len() >= limits.rows_per_page;
        for row in page {
            let object = row.to_json();
            let size = serde_json::to_vec(&object).map(|bytes| bytes.len()).unwrap_or(0) + 1;
            if !batch.rows.is_empty() && batch.bytes + size > budget {
                batch.more = MoreFlag::More;
                return Ok(batch);
            }
            batch.bytes += size;
            batch.last_id = row.id;
            batch.rows.push(object);
        }

        if !full_page {
            break;
        }
        if batch.bytes >= budget {
            batch.more = MoreFlag::More;
            break;
        }
    }
    Ok(batch)
}

/// Age in seconds of the oldest history row not yet delivered.
pub async fn proxy_delay(store: &dyn StagingStore) -> StoreResult<i64> {
    let cursor = store.last_id(Stream::History.cursor()).await?;
    Ok(match store.first_write_clock_after(Stream::History, cursor).await? {
        Some(written) => (unix_now() - written).max(0),
        None => 0,
    })
}

/// What to gather into one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchContents {
    pub history: bool,
    pub discovery: bool,
    pub autoreg: bool,
    pub availability: bool,
    pub tasks: bool,
}

impl BatchContents {
    /// Everything a `proxy data` exchange carries.
    pub const PROXY_DATA: BatchContents = BatchContents {
        history: true,
        discovery: true,
        autoreg: true,
        availability: true,
        tasks: true,
    };

    pub const AVAILABILITY: BatchContents = BatchContents {
        history: false,
        discovery: false,
        autoreg: false,
        availability: true,
        tasks: false,
    };

    pub const TASKS: BatchContents = BatchContents {
        history: false,
        discovery: false,
        autoreg: false,
        availability: false,
        tasks: true,
    };

    /// A single data stream, as requested by the legacy per-stream tags.
    pub fn only(stream: Stream) -> BatchContents {
        BatchContents {
            history: stream == Stream::History,
            discovery: stream == Stream::Discovery,
            autoreg: stream == Stream::Autoreg,
            availability: false,
            tasks: false,
        }
    }

    fn includes(&self, stream: Stream) -> bool {
        match stream {
            Stream::History => self.history,
            Stream::Discovery => self.discovery,
            Stream::Autoreg => self.autoreg,
        }
    }
}

/// Progress to apply once the peer acknowledges the envelope it was built for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingCommit {
    pub progress: Progress,
    pub availability_revision: Option<u64>,
    pub more: MoreFlag,
    /// Tasks the peer piggybacked on its acknowledgement.
    pub received_tasks: Vec<TaskRecord>,
}

impl PendingCommit {
    pub fn is_empty(&self) -> bool {
        self.progress.is_empty() && self.availability_revision.is_none() && self.received_tasks.is_empty()
    }

    pub fn with_received(mut self, tasks: Vec<TaskRecord>) -> Self {
        self.received_tasks = tasks;
        self
    }

    /// Applies an acknowledged exchange. Received tasks are saved first and
    /// nothing moves if that fails; cursors and task statuses then advance in
    /// one store transaction, and availability is acknowledged only after it.
    pub async fn commit(self, services: &Services) -> ExchangeResult<()> {
        if !self.received_tasks.is_empty() {
            services.tasks.save_received(None, self.received_tasks).await?;
        }
        if !self.progress.is_empty() {
            services.store.commit(self.progress).await?;
        }
        if let Some(revision) = self.availability_revision {
            services.availability.acknowledge(revision).await;
        }
        Ok(())
    }
}

/// Fills `envelope` with staged data and returns what to commit on success.
///
/// Streams are pulled in order until half the record budget is used; any
/// stream left out that still has rows makes the envelope report more.
pub async fn assemble(
    services: &Services,
    limits: &TransferLimits,
    contents: BatchContents,
    envelope: &mut Envelope,
) -> ExchangeResult<PendingCommit> {
    let mut pending = PendingCommit::default();
    let mut used = 0usize;
    let record_limit = limits.record_limit();

    if contents.availability {
        let snapshot = services.availability.pending().await;
        if !snapshot.is_empty() {
            if !snapshot.interfaces.is_empty() {
                let value = to_value(&snapshot.interfaces)?;
                used += value.to_string().len();
                envelope.set_field(field::INTERFACE_AVAILABILITY, value);
            }
            if !snapshot.hosts.is_empty() {
                let value = to_value(&snapshot.hosts)?;
                used += value.to_string().len();
                envelope.set_field(field::HOST_DATA, value);
            }
            pending.availability_revision = Some(snapshot.revision);
        }
    }

    if contents.history {
        let delay = proxy_delay(services.store.as_ref()).await?;
        if delay > 0 {
            envelope.set_field(field::PROXY_DELAY, delay);
        }
    }

    for stream in Stream::ALL {
        if !contents.includes(stream) {
            continue;
        }
        if used >= limits.batch_limit() {
            let cursor = services.store.last_id(stream.cursor()).await?;
            if !services.store.rows_after(stream, cursor, 1).await?.is_empty() {
                pending.more = MoreFlag::More;
            }
            continue;
        }

        let batch = get_batch(
            services.store.as_ref(),
            limits,
            stream,
            record_limit.saturating_sub(used),
        )
        .await?;
        pending.more = pending.more.merge(batch.more);
        if batch.is_empty() {
            continue;
        }
        used += batch.bytes;
        pending.progress.cursors.push((stream.cursor(), batch.last_id));
        envelope.set_field(stream.data_tag(), Value::Array(batch.rows));
    }

    if contents.tasks {
        let budget = record_limit.saturating_sub(used);
        let mut rows = Vec::new();
        let mut bytes = 0usize;
        for task in services.store.pending_tasks().await? {
            let row = to_value(&task)?;
            let size = row.to_string().len() + 1;
            if used >= limits.batch_limit() || (!rows.is_empty() && bytes + size > budget) {
                pending.more = MoreFlag::More;
                break;
            }
            bytes += size;
            pending.progress.task_status.push((task.taskid, TaskStatus::Done));
            rows.push(row);
        }
        if !rows.is_empty() {
            envelope.set_field(field::TASKS, Value::Array(rows));
        }
    }

    envelope.set_more(pending.more);
    Ok(pending)
}

fn to_value<T: serde::Serialize>(value: &T) -> ExchangeResult<Value> {
    serde_json::to_value(value).map_err(|err| ExchangeError::Protocol(err.to_string()))
}

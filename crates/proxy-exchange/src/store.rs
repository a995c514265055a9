use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::record::{CursorKey, Record, StagedRow, Stream, TaskRecord, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Backend(String),
    #[error("unknown task {0}")]
    UnknownTask(u64),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Progress made by one acknowledged exchange. Applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub cursors: Vec<(CursorKey, u64)>,
    pub task_status: Vec<(u64, TaskStatus)>,
}

impl Progress {
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty() && self.task_status.is_empty()
    }
}

/// Durable side of the transfer engine: lastid cursors, the staging tables and
/// the queue of task results waiting to go upstream.
///
/// Buffered and direct backends sit behind this one interface.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn last_id(&self, cursor: CursorKey) -> StoreResult<u64>;

    /// Inserts the cursor if absent, otherwise updates it.
    async fn set_last_id(&self, cursor: CursorKey, value: u64) -> StoreResult<()>;

    /// Rows with `id > after` in ascending id order, at most `limit`.
    async fn rows_after(&self, stream: Stream, after: u64, limit: usize) -> StoreResult<Vec<StagedRow>>;

    /// Buffers a record and returns its id.
    async fn append(&self, record: Record, write_clock: i64) -> StoreResult<u64>;

    async fn first_write_clock_after(&self, stream: Stream, after: u64) -> StoreResult<Option<i64>>;

    async fn queue_task(&self, task: TaskRecord) -> StoreResult<()>;

    /// Task results still waiting for an upstream acknowledgement.
    async fn pending_tasks(&self) -> StoreResult<Vec<TaskRecord>>;

    /// Applies cursor advances and task status changes in one transaction.
    async fn commit(&self, progress: Progress) -> StoreResult<()>;
}

#[derive(Default)]
struct MemoryState {
    cursors: HashMap<CursorKey, u64>,
    tables: HashMap<Stream, BTreeMap<u64, StagedRow>>,
    next_id: HashMap<Stream, u64>,
    tasks: BTreeMap<u64, (TaskRecord, TaskStatus)>,
}

/// In-memory adapter for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts a row under an explicit id, leaving gaps where the caller wants them.
    pub async fn insert_row(&self, row: StagedRow) {
        let mut state = self.state.lock().await;
        let stream = row.record.stream();
        let next = state.next_id.entry(stream).or_insert(0);
        *next = (*next).max(row.id);
        state.tables.entry(stream).or_default().insert(row.id, row);
    }

    pub async fn task_status(&self, taskid: u64) -> Option<TaskStatus> {
        self.state
            .lock()
            .await
            .tasks
            .get(&taskid)
            .map(|(_, status)| *status)
    }

    pub async fn row_count(&self, stream: Stream) -> usize {
        self.state
            .lock()
            .await
            .tables
            .get(&stream)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn last_id(&self, cursor: CursorKey) -> StoreResult<u64> {
        Ok(self
            .state
            .lock()
            .await
            .cursors
            .get(&cursor)
            .copied()
            .unwrap_or(0))
    }

    async fn set_last_id(&self, cursor: CursorKey, value: u64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.cursors.entry(cursor).or_insert(0);
        *entry = (*entry).max(value);
        Ok(())
    }

    async fn rows_after(&self, stream: Stream, after: u64, limit: usize) -> StoreResult<Vec<StagedRow>> {
        let state = self.state.lock().await;
        let Some(table) = state.tables.get(&stream) else {
            return Ok(Vec::new());
        };
        Ok(table
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn append(&self, record: Record, write_clock: i64) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let stream = record.stream();
        let next = state.next_id.entry(stream).or_insert(0);
        *next += 1;
        let id = *next;
        state.tables.entry(stream).or_default().insert(
            id,
            StagedRow {
                id,
                write_clock,
                record,
            },
        );
        Ok(id)
    }

    async fn first_write_clock_after(&self, stream: Stream, after: u64) -> StoreResult<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state.tables.get(&stream).and_then(|table| {
            table
                .range(after.saturating_add(1)..)
                .next()
                .map(|(_, row)| row.write_clock)
        }))
    }

    async fn queue_task(&self, task: TaskRecord) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .tasks
            .insert(task.taskid, (task, TaskStatus::New));
        Ok(())
    }

    async fn pending_tasks(&self) -> StoreResult<Vec<TaskRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .tasks
            .values()
            .filter(|(_, status)| matches!(status, TaskStatus::New | TaskStatus::InProgress))
            .map(|(task, _)| task.clone())
            .collect())
    }

    async fn commit(&self, progress: Progress) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some((taskid, _)) = progress
            .task_status
            .iter()
            .find(|(taskid, _)| !state.tasks.contains_key(taskid))
        {
            return Err(StoreError::UnknownTask(*taskid));
        }

        for (cursor, value) in progress.cursors {
            let entry = state.cursors.entry(cursor).or_insert(0);
            *entry = (*entry).max(value);
        }
        for (taskid, status) in progress.task_status {
            if let Some(entry) = state.tasks.get_mut(&taskid) {
                entry.1 = status;
            }
        }
        Ok(())
    }
}

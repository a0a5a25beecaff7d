//! In-memory implementation of WorkStore for testing

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::store::*;

#[derive(Default)]
struct Tables {
    tasks: BTreeMap<TaskId, TaskRecord>,
    errors: Vec<ErrorRecord>,
    next_task_id: TaskId,
    next_error_id: i64,
}

impl Tables {
    /// The task, if `attempt` still holds its claim
    fn claimed_mut(&mut self, id: TaskId, attempt: u32) -> Result<&mut TaskRecord, StoreError> {
        let task = self.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        if task.status != TaskStatus::Running || task.attempts != attempt {
            return Err(StoreError::ClaimLost { id, attempt });
        }
        Ok(task)
    }

    fn push_error(&mut self, task_id: TaskId, detail: &str) {
        self.next_error_id += 1;
        self.errors.push(ErrorRecord {
            id: self.next_error_id,
            task_id,
            detail: detail.to_string(),
            created_at: Utc::now(),
        });
    }
}

/// In-memory implementation of WorkStore
///
/// This is primarily for testing. Every operation runs under one lock,
/// which gives claim the same exactly-once guarantee as the PostgreSQL
/// implementation.
///
/// # Example
///
/// ```
/// use courier_queue::InMemoryWorkStore;
///
/// let store = InMemoryWorkStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryWorkStore {
    tables: Mutex<Tables>,
}

impl InMemoryWorkStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task with an explicit status, bypassing ingestion
    pub fn seed(&self, payload: &str, status: TaskStatus) -> TaskId {
        let mut tables = self.tables.lock();
        tables.next_task_id += 1;
        let id = tables.next_task_id;
        let now = Utc::now();
        tables.tasks.insert(
            id,
            TaskRecord {
                id,
                payload: payload.to_string(),
                status,
                attempts: 0,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Get the number of tasks
    pub fn task_count(&self) -> usize {
        self.tables.lock().tasks.len()
    }

    /// Count tasks currently in `status`
    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tables
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    /// Age a task's `updated_at`, as if it had been untouched for `by`
    pub fn backdate(&self, id: TaskId, by: Duration) {
        if let Some(task) = self.tables.lock().tasks.get_mut(&id) {
            task.updated_at = task.updated_at - chrono::Duration::from_std(by).unwrap_or_default();
        }
    }
}

#[async_trait]
impl WorkStore for InMemoryWorkStore {
    async fn create(&self, payload: &str) -> Result<TaskId, StoreError> {
        Ok(self.seed(payload, TaskStatus::New))
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let mut tables = self.tables.lock();
        let now = Utc::now();

        let claimed = tables
            .tasks
            .values_mut()
            .filter(|t| t.status.is_claimable())
            .take(limit)
            .map(|t| {
                t.status = TaskStatus::Running;
                t.attempts += 1;
                t.updated_at = now;
                t.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<TaskId>, StoreError> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(threshold).unwrap_or_default();

        Ok(tables
            .tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Running && t.updated_at < cutoff)
            .map(|t| {
                t.status = TaskStatus::Failure;
                t.updated_at = now;
                t.id
            })
            .collect())
    }

    async fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::TaskNotFound(id))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn record_error(&self, id: TaskId, detail: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if !tables.tasks.contains_key(&id) {
            return Err(StoreError::TaskNotFound(id));
        }
        tables.push_error(id, detail);
        Ok(())
    }

    async fn mark_failure(&self, id: TaskId, attempt: u32) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let task = tables.claimed_mut(id, attempt)?;
        task.status = TaskStatus::Failure;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_fatal(&self, id: TaskId, attempt: u32, detail: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let task = tables.claimed_mut(id, attempt)?;
        task.status = TaskStatus::Fatal;
        task.updated_at = Utc::now();
        tables.push_error(id, detail);
        Ok(())
    }

    async fn mark_success(
        &self,
        id: TaskId,
        attempt: u32,
        payload: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let task = tables.claimed_mut(id, attempt)?;
        task.status = TaskStatus::Success;
        task.payload = payload.to_string();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tables.lock().tasks.get(&id).cloned())
    }

    async fn errors(&self, id: TaskId) -> Result<Vec<ErrorRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .errors
            .iter()
            .filter(|e| e.task_id == id)
            .cloned()
            .collect())
    }
}

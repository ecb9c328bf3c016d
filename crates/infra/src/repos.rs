//! Request bookkeeping (status and usage), used for observability.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamforge_core::{RequestId, RequestStatus};

/// Repository error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("request not found: {0}")]
    NotFound(RequestId),
    #[error("request already exists: {0}")]
    AlreadyExists(RequestId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Token accounting recorded after a completed generation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

impl Usage {
    /// Whitespace-delimited estimate for providers that do not report usage.
    pub fn estimate(prompt: &str, completion_fragments: u64) -> Self {
        Self {
            prompt_tokens: prompt.split_whitespace().count() as u64,
            completion_tokens: completion_fragments,
            cost: 0.0,
        }
    }
}

/// Input for [`RequestRepository::create_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewRequest {
    pub request_id: RequestId,
    pub prompt: String,
    pub model: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub prompt: String,
    pub model: String,
    pub user_id: Option<String>,
    pub status: RequestStatus,
    pub error: Option<String>,
    pub usage: Option<Usage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for request records.
pub trait RequestRepository: Send + Sync {
    fn create_request(&self, request: NewRequest) -> Result<RequestRecord, RepositoryError>;

    fn update_request_status(
        &self,
        request_id: &RequestId,
        status: RequestStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError>;

    fn record_usage(&self, request_id: &RequestId, usage: Usage) -> Result<(), RepositoryError>;

    fn get_request(&self, request_id: &RequestId) -> Result<Option<RequestRecord>, RepositoryError>;
}

#[derive(Debug, Default)]
struct Store {
    records: HashMap<RequestId, RequestRecord>,
    history: HashMap<RequestId, Vec<RequestStatus>>,
}

/// In-memory repository for tests/dev. Keeps every status a request went
/// through.
#[derive(Debug, Default)]
pub struct InMemoryRequestRepository {
    store: RwLock<Store>,
}

impl InMemoryRequestRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses recorded for `request_id`, oldest first.
    pub fn status_history(&self, request_id: &RequestId) -> Vec<RequestStatus> {
        self.read()
            .map(|s| s.history.get(request_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Store>, RepositoryError> {
        self.store
            .read()
            .map_err(|_| RepositoryError::Storage("repository poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Store>, RepositoryError> {
        self.store
            .write()
            .map_err(|_| RepositoryError::Storage("repository poisoned".to_string()))
    }
}

impl RequestRepository for InMemoryRequestRepository {
    fn create_request(&self, request: NewRequest) -> Result<RequestRecord, RepositoryError> {
        let mut store = self.write()?;
        if store.records.contains_key(&request.request_id) {
            return Err(RepositoryError::AlreadyExists(request.request_id));
        }

        let now = Utc::now();
        let record = RequestRecord {
            request_id: request.request_id.clone(),
            prompt: request.prompt,
            model: request.model,
            user_id: request.user_id,
            status: RequestStatus::Pending,
            error: None,
            usage: None,
            created_at: now,
            updated_at: now,
        };
        store.records.insert(request.request_id.clone(), record.clone());
        store
            .history
            .insert(request.request_id, vec![RequestStatus::Pending]);
        Ok(record)
    }

    fn update_request_status(
        &self,
        request_id: &RequestId,
        status: RequestStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut store = self.write()?;
        let record = store
            .records
            .get_mut(request_id)
            .ok_or_else(|| RepositoryError::NotFound(request_id.clone()))?;
        record.status = status;
        record.error = error.map(str::to_string);
        record.updated_at = Utc::now();
        store
            .history
            .entry(request_id.clone())
            .or_default()
            .push(status);
        Ok(())
    }

    fn record_usage(&self, request_id: &RequestId, usage: Usage) -> Result<(), RepositoryError> {
        let mut store = self.write()?;
        let record = store
            .records
            .get_mut(request_id)
            .ok_or_else(|| RepositoryError::NotFound(request_id.clone()))?;
        record.usage = Some(usage);
        record.updated_at = Utc::now();
        Ok(())
    }

    fn get_request(&self, request_id: &RequestId) -> Result<Option<RequestRecord>, RepositoryError> {
        Ok(self.read()?.records.get(request_id).cloned())
    }
}

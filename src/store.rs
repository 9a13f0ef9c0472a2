use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::retry::{FailureDecision, FailureOutcome, RetryPolicy};
use crate::types::{
    DeadLetterEntry, NewWebhookEvent, StatsFilter, StatusCounts, WebhookEvent, WebhookStatus,
};

const EVENTS_FILE: &str = "webhook_events.json";
const DEAD_LETTERS_FILE: &str = "dead_letters.json";

/// Result of `create`: a fresh record, or the one already recorded for the
/// same `(source, provider_event_id)`.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(WebhookEvent),
    Existing(WebhookEvent),
}

impl CreateOutcome {
    pub fn event(&self) -> &WebhookEvent {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::Existing(e) => e,
        }
    }
}

/// Durable storage for webhook events and their dead-letter entries.
///
/// Implementations must apply each mutation atomically per record; status
/// changes are validated against the lifecycle in `WebhookStatus`.
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    async fn create(&self, new: NewWebhookEvent) -> Result<CreateOutcome, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError>;

    async fn mark_processing(&self, id: Uuid) -> Result<WebhookEvent, StoreError>;

    async fn mark_completed(&self, id: Uuid) -> Result<WebhookEvent, StoreError>;

    /// Count a failed attempt and apply `policy`; dead-lettering writes the
    /// `DeadLetterEntry` in the same critical section.
    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, StoreError>;

    /// failed -> pending. `retry_count` is kept.
    async fn reset_to_pending(&self, id: Uuid) -> Result<WebhookEvent, StoreError>;

    async fn list_retryable(
        &self,
        max_batch: usize,
        cooldown: Duration,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    /// Records sitting in `status` since before `older_than`, oldest first.
    async fn list_stale(
        &self,
        status: WebhookStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    async fn count_by_status(&self, filter: &StatsFilter) -> Result<StatusCounts, StoreError>;

    /// Failed and dead-lettered events, most recently updated first.
    async fn recent_failures(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError>;

    /// All dead-letter entries, newest first.
    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, StoreError>;

    async fn annotate_dead_letter(
        &self,
        event_id: Uuid,
        note: &str,
    ) -> Result<DeadLetterEntry, StoreError>;
}

#[derive(Default)]
struct StoreState {
    events: HashMap<Uuid, WebhookEvent>,
    dead_letters: HashMap<Uuid, DeadLetterEntry>,
}

/// Event store kept in memory and mirrored to JSON files under `data_dir`.
pub struct JsonFileStore {
    state: RwLock<StoreState>,
    data_dir: Option<PathBuf>,
}

impl JsonFileStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            data_dir: None,
        }
    }

    /// Open (or create) a store under `data_dir`, loading any saved records.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let mut state = StoreState::default();
        if let Some(events) = read_json::<Vec<WebhookEvent>>(&data_dir.join(EVENTS_FILE)).await? {
            state.events = events.into_iter().map(|e| (e.id, e)).collect();
        }
        if let Some(entries) =
            read_json::<Vec<DeadLetterEntry>>(&data_dir.join(DEAD_LETTERS_FILE)).await?
        {
            state.dead_letters = entries
                .into_iter()
                .map(|d| (d.webhook_event_id, d))
                .collect();
        }

        tracing::info!(
            data_dir = %data_dir.display(),
            events = state.events.len(),
            dead_letters = state.dead_letters.len(),
            "loaded webhook event store"
        );

        Ok(Self {
            state: RwLock::new(state),
            data_dir: Some(data_dir),
        })
    }

    async fn save_events(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let mut items: Vec<&WebhookEvent> = state.events.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        write_json(&dir.join(EVENTS_FILE), &items).await
    }

    async fn save_dead_letters(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let mut items: Vec<&DeadLetterEntry> = state.dead_letters.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        write_json(&dir.join(DEAD_LETTERS_FILE), &items).await
    }

    /// Put `event` in the map and persist it. A failed write puts the
    /// previous record back so memory never runs ahead of disk.
    async fn commit_event(
        &self,
        state: &mut StoreState,
        event: WebhookEvent,
    ) -> Result<(), StoreError> {
        let id = event.id;
        let previous = state.events.insert(id, event);
        if let Err(e) = self.save_events(state).await {
            match previous {
                Some(previous) => state.events.insert(id, previous),
                None => state.events.remove(&id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn commit_dead_letter(
        &self,
        state: &mut StoreState,
        entry: DeadLetterEntry,
    ) -> Result<(), StoreError> {
        let id = entry.webhook_event_id;
        let previous = state.dead_letters.insert(id, entry);
        if let Err(e) = self.save_dead_letters(state).await {
            match previous {
                Some(previous) => state.dead_letters.insert(id, previous),
                None => state.dead_letters.remove(&id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Apply a status change under the write lock, validating the lifecycle.
    async fn transition(
        &self,
        id: Uuid,
        to: WebhookStatus,
        apply: impl FnOnce(&mut WebhookEvent, DateTime<Utc>),
    ) -> Result<WebhookEvent, StoreError> {
        let mut state = self.state.write().await;
        let current = state.events.get(&id).ok_or(StoreError::NotFound(id))?;
        if !current.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }
        let now = Utc::now();
        let mut updated = current.clone();
        updated.status = to;
        updated.updated_at = now;
        updated.next_retry_at = None;
        apply(&mut updated, now);
        self.commit_event(&mut state, updated.clone()).await?;
        Ok(updated)
    }
}

#[async_trait]
impl WebhookEventStore for JsonFileStore {
    async fn create(&self, new: NewWebhookEvent) -> Result<CreateOutcome, StoreError> {
        let mut state = self.state.write().await;

        if let Some(provider_id) = new.provider_event_id.as_deref() {
            if let Some(existing) = state.events.values().find(|e| {
                e.source == new.source && e.provider_event_id.as_deref() == Some(provider_id)
            }) {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
        }

        let event = new.into_event(Utc::now());
        self.commit_event(&mut state, event.clone()).await?;
        Ok(CreateOutcome::Created(event))
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self.state.read().await.events.get(&id).cloned())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<WebhookEvent, StoreError> {
        self.transition(id, WebhookStatus::Processing, |_, _| {}).await
    }

    async fn mark_completed(&self, id: Uuid) -> Result<WebhookEvent, StoreError> {
        self.transition(id, WebhookStatus::Completed, |event, now| {
            event.processed_at = Some(now);
            event.error_message = None;
        })
        .await
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, StoreError> {
        let mut state = self.state.write().await;
        let original = state
            .events
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;

        let decision = policy.decide(original.retry_count);
        let to = decision.status();
        if !original.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id,
                from: original.status,
                to,
            });
        }

        let now = Utc::now();
        let mut updated = original.clone();
        updated.retry_count = decision.retry_count();
        updated.status = to;
        updated.error_message = Some(error.to_string());
        updated.updated_at = now;
        updated.next_retry_at = match decision {
            FailureDecision::Retry { delay, .. } => chrono::Duration::from_std(delay)
                .ok()
                .map(|d| now + d),
            FailureDecision::DeadLetter { .. } => None,
        };
        self.commit_event(&mut state, updated).await?;

        if let FailureDecision::DeadLetter { .. } = decision {
            let entry = DeadLetterEntry {
                webhook_event_id: id,
                final_error: error.to_string(),
                created_at: now,
                review_note: None,
                reviewed_at: None,
            };
            if let Err(e) = self.commit_dead_letter(&mut state, entry).await {
                // Never leave a dead-lettered event without its entry.
                state.events.insert(id, original);
                if let Err(restore) = self.save_events(&state).await {
                    tracing::error!(
                        event_id = %id,
                        error = %restore,
                        "failed to restore webhook event after dead-letter write failure"
                    );
                }
                return Err(e);
            }
        }
        Ok(FailureOutcome::from_decision(&decision))
    }

    async fn reset_to_pending(&self, id: Uuid) -> Result<WebhookEvent, StoreError> {
        self.transition(id, WebhookStatus::Pending, |event, _| {
            event.error_message = None;
        })
        .await
    }

    async fn list_retryable(
        &self,
        max_batch: usize,
        cooldown: Duration,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let cooldown = chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero());
        let state = self.state.read().await;
        let mut ready: Vec<WebhookEvent> = state
            .events
            .values()
            .filter(|e| {
                e.status == WebhookStatus::Failed
                    && e.retry_count < max_retries
                    && e.updated_at + cooldown <= now
                    && e.next_retry_at.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        ready.truncate(max_batch);
        Ok(ready)
    }

    async fn list_stale(
        &self,
        status: WebhookStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let state = self.state.read().await;
        let mut stale: Vec<WebhookEvent> = state
            .events
            .values()
            .filter(|e| e.status == status && e.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(stale)
    }

    async fn count_by_status(&self, filter: &StatsFilter) -> Result<StatusCounts, StoreError> {
        let state = self.state.read().await;
        let mut counts = StatusCounts::default();
        for event in state.events.values().filter(|e| filter.matches(e)) {
            counts.add(event.status);
        }
        Ok(counts)
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        let state = self.state.read().await;
        let mut failures: Vec<WebhookEvent> = state
            .events
            .values()
            .filter(|e| matches!(e.status, WebhookStatus::Failed | WebhookStatus::DeadLetter))
            .cloned()
            .collect();
        failures.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failures.truncate(limit);
        Ok(failures)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let state = self.state.read().await;
        let mut entries: Vec<DeadLetterEntry> = state.dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn annotate_dead_letter(
        &self,
        event_id: Uuid,
        note: &str,
    ) -> Result<DeadLetterEntry, StoreError> {
        let mut state = self.state.write().await;
        let mut entry = state
            .dead_letters
            .get(&event_id)
            .cloned()
            .ok_or(StoreError::DeadLetterNotFound(event_id))?;
        entry.review_note = Some(note.to_string());
        entry.reviewed_at = Some(Utc::now());
        self.commit_dead_letter(&mut state, entry.clone()).await?;
        Ok(entry)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write via a sibling temp file and rename so a crash never leaves a
/// half-written file behind.
async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

//! Signed webhook ingestion for the model marketplace: verification,
//! durable event records, retry with backoff and a dead-letter queue.

pub mod config;
pub mod error;
pub mod handlers;
pub mod http_server;
pub mod monitor;
pub mod payloads;
pub mod processor;
pub mod retry;
pub mod retry_worker;
pub mod store;
pub mod types;
pub mod verification;

pub use config::AppConfig;
pub use error::{ApiError, ProcessError, StoreError};
pub use handlers::{marketplace_registry, HandlerRegistry, MarketplaceActions, WebhookHandler};
pub use processor::{Processed, WebhookProcessor};
pub use retry::{RetryManager, RetryPolicy};
pub use store::{JsonFileStore, WebhookEventStore};
pub use types::{WebhookEvent, WebhookSource, WebhookStatus};

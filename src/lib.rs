//! Client-side sync engine for keeping local application records
//! consistent with a remote collection server.
//!
//! Synchronization is incremental: a cursor marks how far into the
//! remote change log this client has read, pulls fetch everything past
//! it, and pushes send pending local records conditional on the cursor
//! still being current. Polling adapts to server backpressure
//! (`Retry-After` and poll-time headers, 5xx responses) and to
//! application lifecycle events (login/logout, visibility).
//!
//! # Components
//!
//! - [`HttpTransport`]: one authenticated request/response exchange per
//!   call against the collection endpoint
//! - [`SyncEngine`]: drives get-then-put cycles, owns the cursor and the
//!   collection identity
//! - [`Scheduler`]: the repeating timer, backing off on server signals
//!   and speeding up on local activity
//!
//! The application supplies its side through three seams: a
//! [`LocalStore`] holding the actual records, a [`MetadataStore`] for
//! durable sync bookkeeping, and an [`AuthProvider`] for credentials.
//!
//! # Usage
//!
//! ```ignore
//! use bucketsync::{
//!     HeaderAuth, HttpTransport, FileMetadata, Scheduler, ScheduleSettings, SyncEngine,
//! };
//! use std::sync::Arc;
//!
//! let auth: Arc<dyn bucketsync::AuthProvider> =
//!     Arc::new(HeaderAuth::new("X-Remote-User", "alice@example.com", "example.com"));
//! let (transport, events) = HttpTransport::new(endpoint_url, auth.clone());
//! let metadata = Arc::new(FileMetadata::open(metadata_path)?);
//!
//! let engine = Arc::new(SyncEngine::new(Arc::new(transport), app_store, metadata));
//! engine.load().await?;
//!
//! let scheduler = Arc::new(Scheduler::new(engine, ScheduleSettings::default()));
//! scheduler.watch_transport(events);
//! scheduler.watch_auth(&auth);
//! ```

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod protocol;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use auth::{AuthEvent, AuthProvider, HeaderAuth};
pub use config::{ConfigError, SyncConfig};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use metadata::{FileMetadata, MemoryMetadata, MetadataStore};
pub use protocol::{BlobRef, DeleteReason, Delta, PushResponse};
pub use record::{Blob, ObjectError, RecordError, RecordKey, SyncRecord};
pub use scheduler::{ScheduleSettings, ScheduleState, Scheduler};
pub use store::{LocalStore, StatusKind, SyncStatus};
pub use transport::{BackoffSignal, HttpTransport, Transport, TransportEvent};

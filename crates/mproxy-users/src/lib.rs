//! Token-addressed users: per-family quotas, IP enforcement, lifecycle jobs
//! and pluggable persistence.
//!
//! Runtime reads never hit the database; the store is the in-memory source of
//! truth and a single writer task flushes dirty users on an interval.

mod jobs;
mod persistence;
mod sqlite;
mod store;
mod user;

pub use jobs::spawn_store_jobs;
pub use persistence::{MemoryPersistence, PersistenceError, UserPersistence};
pub use sqlite::SqliteStore;
pub use store::{AuthOutcome, QuotaCheck, UserStore, UserStoreError};
pub use user::{TokenCounts, User, UserKind, UserPatch};

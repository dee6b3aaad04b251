//! Credential ownership: the pool, its lockout bookkeeping, the
//! cache-affinity router and the per-provider health checkers.
//!
//! The pool is the only owner of credential records. `select` hands out
//! by-value snapshots; everything else goes through the pool's own mutation
//! methods so updates stay atomic with respect to selection.

pub mod affinity;
pub mod auth;
pub mod checker;
mod credential;
mod lockout;
mod pool;
mod tunables;

pub use affinity::{CacheRouter, FingerprintSet, fingerprint};
pub use credential::{
    Credential, CredentialKind, CredentialPatch, CredentialSeed, DisabledReason, TokenUsage,
    credential_hash,
};
pub use pool::{CredentialPool, SelectError, SelectRequest, UsageDelta};
pub use tunables::{key_reuse_delay, rate_limit_lockout};

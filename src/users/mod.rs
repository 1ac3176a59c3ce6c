//! User account storage, lookup and replication.
//!
//! The account universe replicated from the backends' grant tables lives
//! in immutable [`UserDatabase`] snapshots. A background
//! [`UserAccountManager`] rebuilds the snapshot by polling backends;
//! per-worker [`UserAccountCache`] views answer authentication lookups
//! against the snapshot they currently hold.

mod cache;
mod database;
mod entry;
mod hostmatch;
mod manager;

pub use cache::{UserAccountCache, UserEntryKind, UserSearchResult};
pub use database::{StringSetMap, UserDatabase};
pub use entry::{UserEntry, UserSearchSettings};
pub use hostmatch::{NameResolver, ReverseDnsCache, SystemResolver};
pub use manager::UserAccountManager;

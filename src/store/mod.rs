//! Persistent store for work items and leases.
//!
//! A single SQLite file per repository namespace. Leases are rows, not
//! in-memory state, so any number of processes can share the file:
//!
//! ```ignore
//! use scryer::store::WorkStore;
//!
//! let store = WorkStore::open(Path::new("/var/lib/scryer/state/acme.db"))?;
//! if let Some(item) = store.claim(&[42, 43], &owner, Duration::seconds(2400))? {
//!     // ... process ...
//!     store.release(item.id, &owner, &outcome, ItemStatus::Done)?;
//! }
//! ```

mod clock;
mod records;
mod work_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use records::{ItemStatus, WorkItem};
pub use work_store::{DEFAULT_MAX_INFRA_RETRIES, WorkStore};

//! proctrack - process/thread identity tracking for trace ingestion.
//!
//! Raw system traces refer to threads by kernel tid and pid, both of which
//! the OS recycles while a trace is running. This library maps those
//! unstable ids onto stable utid/upid handles that downstream tables can
//! use as foreign keys, and resolves thread/process relationships whose
//! evidence arrives out of order.
//!
//! # Modules
//!
//! - [`tracker`] - the stateful identity resolver driven by trace parsers
//! - [`storage`] - columnar thread/process/args tables, string interning
//!   and stat counters shared by all ingesters of a session
//! - [`args`] - buffered sidecar for process-scoped key/value arguments
//!
//! # Example
//!
//! ```
//! use proctrack::{ProcessTracker, TraceStorage};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let storage = Rc::new(RefCell::new(TraceStorage::new()));
//! let mut tracker = ProcessTracker::new(storage.clone());
//!
//! // A sched event for tid 1001 in thread group 1000.
//! let utid = tracker.update_thread(1001, 1000);
//! let upid = storage.borrow().threads().upid(utid).unwrap();
//! assert_eq!(storage.borrow().processes().pid(upid), 1000);
//! ```

pub mod args;
pub mod storage;
pub mod tracker;

// Re-export for convenience
pub use args::{ArgsTracker, BoundInserter};
pub use storage::{
    ArgRow, ArgValue, ProcessRow, Stat, StringId, ThreadRow, TraceStorage, Upid, Utid,
};
pub use tracker::{ProcessTracker, ThreadNamePriority};

//! Buffered args sidecar for process-scoped key/value arguments.
//!
//! Ingesters attach args to a process as they parse packets, but the rows
//! only land in the arg table when the tracker flushes at end of file. The
//! buffer-then-drain split keeps arg insertion cheap on the hot path.

use crate::storage::{ArgRow, ArgValue, StringId, TraceStorage, Upid};

#[derive(Clone, Debug)]
struct PendingArg {
    upid: Upid,
    flat_key: StringId,
    key: StringId,
    value: ArgValue,
}

/// Accumulates args until [`ArgsTracker::flush`] drains them into storage.
#[derive(Default)]
pub struct ArgsTracker {
    pending: Vec<PendingArg>,
}

impl ArgsTracker {
    pub fn new() -> Self {
        ArgsTracker::default()
    }

    /// Hand out an inserter bound to `upid`. Args added through it are
    /// buffered, not yet visible in the arg table.
    pub fn add_args_to(&mut self, upid: Upid) -> BoundInserter<'_> {
        BoundInserter { args: self, upid }
    }

    /// Drain every buffered arg into the arg table.
    pub fn flush(&mut self, storage: &mut TraceStorage) {
        for arg in self.pending.drain(..) {
            storage.args_mut().insert(ArgRow {
                upid: arg.upid,
                flat_key: arg.flat_key,
                key: arg.key,
                value: arg.value,
            });
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Inserter tied to a single process row.
pub struct BoundInserter<'a> {
    args: &'a mut ArgsTracker,
    upid: Upid,
}

impl BoundInserter<'_> {
    pub fn add_arg(&mut self, flat_key: StringId, key: StringId, value: ArgValue) -> &mut Self {
        self.args.pending.push(PendingArg {
            upid: self.upid,
            flat_key,
            key,
            value,
        });
        self
    }
}

//! Process and thread identity tracking for trace ingestion.
//!
//! Kernel tids and pids are recycled while a trace is being recorded, and
//! different event sources learn about a thread's process membership at
//! different times. This module maps the unstable `(tid, pid)` namespace of
//! the trace onto stable utid/upid handles: once an event has been emitted
//! against a utid, that utid never changes meaning, even if the OS hands
//! the tid to a brand new thread later in the trace.
//!
//! Relationships whose evidence arrives out of order (sibling threads named
//! before their process, a child process forked before the parent thread is
//! bound) are parked in pending buffers and drained transitively as soon as
//! one of the involved threads learns its process.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::args::{ArgsTracker, BoundInserter};
use crate::storage::{ProcessRow, Stat, StringId, ThreadRow, TraceStorage, Upid, Utid};

/// Rank of the source that provided a thread name. A name is only
/// overwritten by a source of equal or higher rank, so a low-confidence
/// kernel record never clobbers a name reported by the process itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadNamePriority {
    Other,
    FtraceSystemInfo,
    OtherKernelRecord,
    FtraceCommit,
    ProcessTree,
    TrustedProducerName,
    TraceProcessorConstant,
}

/// A process as seen from the root PID namespace, with its pid at every
/// nesting level (outermost first) and the root-level tids of its threads.
struct NamespacedProcess {
    nspid: Vec<u32>,
    threads: HashSet<u32>,
}

/// A thread's tid at every namespace level, same nesting order as the
/// owning process's nspid chain.
struct NamespacedThread {
    nstid: Vec<u32>,
}

/// The identity tracker. One instance per ingestion session, layered over
/// the session's shared [`TraceStorage`].
pub struct ProcessTracker {
    storage: Rc<RefCell<TraceStorage>>,
    args_tracker: ArgsTracker,

    /// tid -> utids observed for it, oldest first. Finished threads are
    /// removed eagerly; threads of exec'd-over processes linger and are
    /// filtered out at lookup time.
    tids: HashMap<u32, Vec<Utid>>,
    /// pid -> upid of the process currently owning that pid.
    pids: HashMap<u32, Upid>,

    /// Priority of the source that last named each thread, indexed by utid.
    /// Always the same length as the thread table.
    thread_name_priorities: Vec<ThreadNamePriority>,

    /// Sibling pairs waiting for either side to learn its process.
    pending_assocs: Vec<(Utid, Utid)>,
    /// (parent utid, child upid) pairs waiting for the parent thread to be
    /// bound to a process.
    pending_parent_assocs: Vec<(Utid, Upid)>,

    namespaced_processes: HashMap<u32, NamespacedProcess>,
    namespaced_threads: HashMap<u32, NamespacedThread>,

    /// Producer uuid -> pid sideband for producers that self-identify.
    trusted_pids: HashMap<u64, u32>,
}

impl ProcessTracker {
    pub fn new(storage: Rc<RefCell<TraceStorage>>) -> Self {
        // One priority slot per existing row keeps the vector aligned with
        // the thread table, reserved idle thread included.
        let thread_name_priorities =
            vec![ThreadNamePriority::Other; storage.borrow().threads().len()];
        ProcessTracker {
            storage,
            args_tracker: ArgsTracker::new(),
            tids: HashMap::new(),
            pids: HashMap::new(),
            thread_name_priorities,
            pending_assocs: Vec::new(),
            pending_parent_assocs: Vec::new(),
            namespaced_processes: HashMap::new(),
            namespaced_threads: HashMap::new(),
            trusted_pids: HashMap::new(),
        }
    }

    /// Allocate a fresh utid for `tid`, regardless of what the tid referred
    /// to before. The new thread becomes the newest live entry for the tid.
    pub fn start_new_thread(&mut self, timestamp: Option<i64>, tid: u32) -> Utid {
        let utid = self.storage.borrow_mut().threads_mut().insert(ThreadRow {
            tid,
            start_ts: timestamp,
            ..Default::default()
        });
        self.tids.entry(tid).or_default().push(utid);
        debug_assert_eq!(self.thread_name_priorities.len(), utid as usize);
        self.thread_name_priorities.push(ThreadNamePriority::Other);
        utid
    }

    /// Mark the live thread for `tid` as ended at `timestamp`. If it is the
    /// main thread of its process, the process ends with it.
    pub fn end_thread(&mut self, timestamp: i64, tid: u32) {
        // A free event for a worker thread can arrive after the main thread
        // already ended the whole process. Don't create a thread just to
        // end it.
        let Some(utid) = self.get_thread_or_null(tid) else {
            return;
        };

        let mut ends_process = false;
        {
            let mut storage = self.storage.borrow_mut();
            storage.threads_mut().set_end_ts(utid, timestamp);
            if let Some(upid) = storage.threads().upid(utid) {
                if storage.processes().pid(upid) == tid {
                    debug_assert_eq!(storage.threads().is_main_thread(utid), Some(true));
                    storage.processes_mut().set_end_ts(upid, timestamp);
                    ends_process = true;
                }
            }
        }

        // Any later event for this tid must not resolve to the finished
        // thread.
        if let Some(live) = self.tids.get_mut(&tid) {
            live.retain(|&u| u != utid);
        }
        if ends_process {
            self.pids.remove(&tid);
        }
    }

    /// The utid the tid currently refers to, if any thread with that tid is
    /// still alive.
    pub fn get_thread_or_null(&self, tid: u32) -> Option<Utid> {
        let utid = self.find_live_thread(tid, None)?;
        let storage = self.storage.borrow();
        debug_assert_eq!(storage.threads().tid(utid), tid);
        debug_assert!(storage.threads().end_ts(utid).is_none());
        Some(utid)
    }

    pub fn get_or_create_thread(&mut self, tid: u32) -> Utid {
        match self.get_thread_or_null(tid) {
            Some(utid) => utid,
            None => self.start_new_thread(None, tid),
        }
    }

    /// Whether the thread can still receive events: it has not ended, its
    /// process (if known) has not ended, and its process's pid has not been
    /// taken over by a newer process.
    pub fn is_thread_alive(&self, utid: Utid) -> bool {
        let storage = self.storage.borrow();

        if storage.threads().end_ts(utid).is_some() {
            return false;
        }
        // Without a process the thread has to be presumed alive.
        let Some(upid) = storage.threads().upid(utid) else {
            return true;
        };
        if storage.processes().end_ts(upid).is_some() {
            return false;
        }
        // A pid remapped to a different upid means a newer process took the
        // pid over, implicitly ending every thread of the old one.
        let pid = storage.processes().pid(upid);
        match self.pids.get(&pid) {
            Some(&current) => current == upid,
            None => true,
        }
    }

    /// Newest-first search of the live threads for `tid`, optionally
    /// constrained to threads whose process has the given pid. Newest-first
    /// biases resolution toward the most recent recycling of the tid.
    fn find_live_thread(&self, tid: u32, pid: Option<u32>) -> Option<Utid> {
        let candidates = self.tids.get(&tid)?;
        let storage = self.storage.borrow();
        for &utid in candidates.iter().rev() {
            // Finished threads are removed from the live list eagerly.
            debug_assert!(storage.threads().end_ts(utid).is_none());
            if !self.is_thread_alive(utid) {
                continue;
            }
            // A thread that does not know its process yet matches any pid.
            let Some(current_upid) = storage.threads().upid(utid) else {
                return Some(utid);
            };
            let current_pid = storage.processes().pid(current_upid);
            if pid.is_none() || pid == Some(current_pid) {
                return Some(utid);
            }
        }
        None
    }

    /// Name the live (or newly created) thread for `tid`, subject to the
    /// priority gate.
    pub fn update_thread_name(
        &mut self,
        tid: u32,
        thread_name: StringId,
        priority: ThreadNamePriority,
    ) -> Utid {
        let utid = self.get_or_create_thread(tid);
        self.update_thread_name_by_utid(utid, thread_name, priority);
        utid
    }

    /// Write `thread_name` if `priority` is at least the priority of the
    /// source that named the thread last. Null names are ignored.
    pub fn update_thread_name_by_utid(
        &mut self,
        utid: Utid,
        thread_name: StringId,
        priority: ThreadNamePriority,
    ) {
        if thread_name.is_null() {
            return;
        }
        if priority >= self.thread_name_priorities[utid as usize] {
            self.storage
                .borrow_mut()
                .threads_mut()
                .set_name(utid, thread_name);
            self.thread_name_priorities[utid as usize] = priority;
        }
    }

    /// Like [`ProcessTracker::update_thread_name`], and when the thread
    /// turns out to be the main thread of a process, the process takes the
    /// same name.
    pub fn update_thread_name_and_maybe_process_name(
        &mut self,
        tid: u32,
        thread_name: StringId,
        priority: ThreadNamePriority,
    ) {
        let utid = self.update_thread_name(tid, thread_name, priority);
        let mut storage = self.storage.borrow_mut();
        let Some(upid) = storage.threads().upid(utid) else {
            return;
        };
        if storage.processes().pid(upid) == tid {
            debug_assert_eq!(storage.threads().is_main_thread(utid), Some(true));
            storage.processes_mut().set_name(upid, thread_name);
        }
    }

    /// Hot path for sched and fork events: resolve `(tid, pid)` to a utid,
    /// creating thread and process rows as needed, then drain any pending
    /// associations this binding unblocks.
    pub fn update_thread(&mut self, tid: u32, pid: u32) -> Utid {
        // A thread matching both the tid and the thread group wins;
        // otherwise the tid was recycled (or never seen) and gets a fresh
        // utid.
        let utid = match self.find_live_thread(tid, Some(pid)) {
            Some(utid) => utid,
            None => self.start_new_thread(None, tid),
        };
        debug_assert_eq!(self.storage.borrow().threads().tid(utid), tid);

        let existing_upid = self.storage.borrow().threads().upid(utid);
        let upid = match existing_upid {
            Some(upid) => upid,
            None => {
                let upid = self.get_or_create_process(pid);
                self.associate_thread_to_process(utid, upid);
                upid
            }
        };

        self.resolve_pending_associations(utid, upid);
        utid
    }

    /// The upid currently owning `pid`, allocating a new process row (and
    /// its main thread binding) on first sight.
    pub fn get_or_create_process(&mut self, pid: u32) -> Upid {
        if let Some(&upid) = self.pids.get(&pid) {
            // A pid in the live map always refers to an unfinished process.
            debug_assert!(self.storage.borrow().processes().end_ts(upid).is_none());
            return upid;
        }

        let upid = self
            .storage
            .borrow_mut()
            .processes_mut()
            .insert(ProcessRow { pid });
        self.pids.insert(pid, upid);

        // The main thread may have been running (and observed) long before
        // any process info arrived, so go through update_thread rather than
        // starting a fresh thread.
        self.update_thread(pid, pid);
        upid
    }

    /// Register a new process execution for `pid`. Any process previously
    /// holding the pid is overridden, and the main thread always gets a
    /// fresh utid so old events keep pointing at the old incarnation.
    pub fn start_new_process(
        &mut self,
        timestamp: Option<i64>,
        parent_tid: Option<u32>,
        pid: u32,
        main_thread_name: StringId,
        priority: ThreadNamePriority,
    ) -> Upid {
        self.pids.remove(&pid);
        // Stale utids for this pid stay in the live index; find_live_thread
        // filters them out once the pid maps to the new process.

        let utid = self.start_new_thread(timestamp, pid);
        self.update_thread_name_by_utid(utid, main_thread_name, priority);

        // The pid was erased above, so this always allocates.
        let upid = self.get_or_create_process(pid);

        {
            let mut storage = self.storage.borrow_mut();
            debug_assert!(storage.processes().name(upid).is_none());
            debug_assert!(storage.processes().start_ts(upid).is_none());
            if let Some(ts) = timestamp {
                storage.processes_mut().set_start_ts(upid, ts);
            }
            storage.processes_mut().set_name(upid, main_thread_name);
        }

        if let Some(parent_tid) = parent_tid {
            let parent_utid = self.get_or_create_thread(parent_tid);
            let parent_upid = self.storage.borrow().threads().upid(parent_utid);
            match parent_upid {
                Some(parent_upid) => {
                    self.storage
                        .borrow_mut()
                        .processes_mut()
                        .set_parent_upid(upid, parent_upid);
                }
                // The parent thread does not know its process yet; link the
                // child once it does.
                None => self.pending_parent_assocs.push((parent_utid, upid)),
            }
        }
        upid
    }

    /// Record name/cmdline (and optionally the parent) for a process, e.g.
    /// from a process tree dump. Overwrites unconditionally and does not
    /// start a new process.
    pub fn set_process_metadata(
        &mut self,
        pid: u32,
        ppid: Option<u32>,
        name: &str,
        cmdline: &str,
    ) -> Upid {
        let parent_upid = ppid.map(|ppid| self.get_or_create_process(ppid));
        let upid = self.get_or_create_process(pid);

        let mut storage = self.storage.borrow_mut();
        let name_id = storage.intern(name);
        let cmdline_id = storage.intern(cmdline);
        storage.processes_mut().set_name(upid, name_id);
        storage.processes_mut().set_cmdline(upid, cmdline_id);
        if let Some(parent_upid) = parent_upid {
            storage.processes_mut().set_parent_upid(upid, parent_upid);
        }
        upid
    }

    pub fn set_process_uid(&mut self, upid: Upid, uid: u32) {
        let mut storage = self.storage.borrow_mut();
        storage.processes_mut().set_uid(upid, uid);
        // The Android app id is the uid with the user part stripped off.
        storage.processes_mut().set_android_appid(upid, uid % 100000);
    }

    pub fn set_process_name_if_unset(&mut self, upid: Upid, process_name: StringId) {
        let mut storage = self.storage.borrow_mut();
        if storage.processes().name(upid).is_none() {
            storage.processes_mut().set_name(upid, process_name);
        }
    }

    pub fn set_start_ts_if_unset(&mut self, upid: Upid, start_ts: i64) {
        let mut storage = self.storage.borrow_mut();
        if storage.processes().start_ts(upid).is_none() {
            storage.processes_mut().set_start_ts(upid, start_ts);
        }
    }

    /// Declare that two threads belong to the same process, even if that
    /// process is not known yet.
    pub fn associate_threads(&mut self, utid1: Utid, utid2: Utid) {
        let (upid1, upid2) = {
            let storage = self.storage.borrow();
            (
                storage.threads().upid(utid1),
                storage.threads().upid(utid2),
            )
        };

        match (upid1, upid2) {
            // One side knows its process: propagate it to the other and to
            // anything transitively pending on it.
            (Some(upid), None) => {
                self.associate_thread_to_process(utid2, upid);
                self.resolve_pending_associations(utid2, upid);
            }
            (None, Some(upid)) => {
                self.associate_thread_to_process(utid1, upid);
                self.resolve_pending_associations(utid1, upid);
            }
            (Some(a), Some(b)) if a != b => {
                // Contradictory evidence. Traces are untrusted input, so
                // drop the request instead of corrupting either process.
                let (tid1, tid2) = {
                    let storage = self.storage.borrow();
                    (storage.threads().tid(utid1), storage.threads().tid(utid2))
                };
                tracing::warn!(
                    tid1,
                    tid2,
                    "cannot associate threads already bound to different processes"
                );
                self.storage
                    .borrow_mut()
                    .increment_stat(Stat::ProcessTrackerErrors);
            }
            // Both unbound, or redundantly bound to the same process: park
            // the pair until one side resolves.
            _ => self.pending_assocs.push((utid1, utid2)),
        }
    }

    /// Drain every pending parent/sibling entry unblocked by `utid` now
    /// being bound to `upid`, transitively.
    fn resolve_pending_associations(&mut self, utid: Utid, upid: Upid) {
        debug_assert_eq!(self.storage.borrow().threads().upid(utid), Some(upid));

        let mut worklist = vec![utid];
        while let Some(utid) = worklist.pop() {
            // Child processes waiting on this thread's process.
            let mut i = 0;
            while i < self.pending_parent_assocs.len() {
                let (parent_utid, child_upid) = self.pending_parent_assocs[i];
                if parent_utid != utid {
                    i += 1;
                    continue;
                }
                debug_assert_ne!(child_upid, upid);
                {
                    let mut storage = self.storage.borrow_mut();
                    let existing = storage.processes().parent_upid(child_upid);
                    debug_assert!(existing.is_none() || existing == Some(upid));
                    storage.processes_mut().set_parent_upid(child_upid, upid);
                }
                // Unordered buffer: swap-remove and re-examine the element
                // that took this slot.
                self.pending_parent_assocs.swap_remove(i);
            }

            // Sibling threads waiting on either side of a pair. Swap
            // resolved entries past a sentinel end and truncate after the
            // scan so removal never invalidates the in-flight index.
            let mut end = self.pending_assocs.len();
            let mut i = 0;
            while i < end {
                let (a, b) = self.pending_assocs[i];
                let other = if a == utid {
                    b
                } else if b == utid {
                    a
                } else {
                    i += 1;
                    continue;
                };
                debug_assert_ne!(other, utid);
                debug_assert!({
                    let storage = self.storage.borrow();
                    let other_upid = storage.threads().upid(other);
                    other_upid.is_none() || other_upid == Some(upid)
                });
                self.associate_thread_to_process(other, upid);
                end -= 1;
                self.pending_assocs.swap(i, end);
                // Entries elsewhere in the buffer may be waiting on the
                // newly bound thread.
                worklist.push(other);
            }
            self.pending_assocs.truncate(end);
        }
    }

    fn associate_thread_to_process(&mut self, utid: Utid, upid: Upid) {
        let mut storage = self.storage.borrow_mut();
        storage.threads_mut().set_upid(utid, upid);
        let is_main = storage.threads().tid(utid) == storage.processes().pid(upid);
        storage.threads_mut().set_is_main_thread(utid, is_main);
    }

    /// Record the pid a producer claims for itself, keyed by its uuid.
    pub fn update_trusted_pid(&mut self, trusted_pid: u32, uuid: u64) {
        if let Some(&previous) = self.trusted_pids.get(&uuid) {
            if previous != trusted_pid {
                tracing::debug!(uuid, previous, trusted_pid, "trusted pid rebound for uuid");
            }
        }
        self.trusted_pids.insert(uuid, trusted_pid);
    }

    pub fn get_trusted_pid(&self, uuid: u64) -> Option<u32> {
        self.trusted_pids.get(&uuid).copied()
    }

    /// Register (or re-register) the pid chain of a namespaced process.
    /// Re-registration drops the previously indexed threads.
    pub fn update_namespaced_process(&mut self, root_pid: u32, nspid: Vec<u32>) {
        self.namespaced_processes.insert(
            root_pid,
            NamespacedProcess {
                nspid,
                threads: HashSet::new(),
            },
        );
    }

    /// Register the tid chain of a namespaced thread. The owning process
    /// must have been registered already.
    pub fn update_namespaced_thread(&mut self, root_pid: u32, root_tid: u32, nstid: Vec<u32>) {
        debug_assert!(self.namespaced_processes.contains_key(&root_pid));
        if let Some(process) = self.namespaced_processes.get_mut(&root_pid) {
            process.threads.insert(root_tid);
        }
        self.namespaced_threads
            .insert(root_tid, NamespacedThread { nstid });
    }

    /// Translate a tid as seen inside `root_pid`'s innermost namespace back
    /// to the root-level tid.
    pub fn resolve_namespaced_tid(&self, root_pid: u32, ns_tid: u32) -> Option<u32> {
        if root_pid == 0 {
            return None;
        }
        // A process that does not run in a namespace (or was never dumped)
        // cannot be resolved.
        let process = self.namespaced_processes.get(&root_pid)?;
        let ns_level = process.nspid.len().checked_sub(1)?;
        if process.nspid[ns_level] == ns_tid {
            return Some(root_pid);
        }
        for &root_tid in &process.threads {
            let Some(thread) = self.namespaced_threads.get(&root_tid) else {
                continue;
            };
            debug_assert!(thread.nstid.len() > ns_level);
            if thread.nstid.get(ns_level) == Some(&ns_tid) {
                return Some(root_tid);
            }
        }
        None
    }

    /// Bind tid 0 / pid 0 to the reserved utid 0 / upid 0 idle rows and
    /// name the idle thread. Linux trace ingesters call this; for other
    /// trace types tid 0 stays unbound so a real tid-0 event gets its own
    /// utid.
    pub fn set_pid_zero_is_upid_zero_idle_process(&mut self) {
        self.tids.insert(0, vec![0]);
        self.pids.insert(0, 0);

        let swapper = self.storage.borrow_mut().intern("swapper");
        self.update_thread_name(0, swapper, ThreadNamePriority::TraceProcessorConstant);
    }

    /// Buffered args insertion for `upid`; rows land in the arg table at
    /// end of file.
    pub fn add_args_to(&mut self, upid: Upid) -> BoundInserter<'_> {
        self.args_tracker.add_args_to(upid)
    }

    /// Flush the args sidecar. No identity state is modified.
    pub fn notify_end_of_file(&mut self) {
        self.args_tracker.flush(&mut self.storage.borrow_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ArgValue;

    fn new_tracker() -> (Rc<RefCell<TraceStorage>>, ProcessTracker) {
        let storage = Rc::new(RefCell::new(TraceStorage::new()));
        let tracker = ProcessTracker::new(storage.clone());
        (storage, tracker)
    }

    #[test]
    fn test_start_new_thread_never_recycles_utids() {
        let (storage, mut tracker) = new_tracker();
        let a = tracker.start_new_thread(None, 42);
        let b = tracker.start_new_thread(None, 42);
        assert_ne!(a, b);
        assert_eq!(storage.borrow().threads().tid(a), 42);
        assert_eq!(storage.borrow().threads().tid(b), 42);
        // The newest incarnation wins lookups.
        assert_eq!(tracker.get_thread_or_null(42), Some(b));
    }

    #[test]
    fn test_end_thread_removes_from_live_index() {
        let (storage, mut tracker) = new_tracker();
        let a = tracker.start_new_thread(None, 42);
        tracker.end_thread(200, 42);
        assert_eq!(storage.borrow().threads().end_ts(a), Some(200));
        assert_eq!(tracker.get_thread_or_null(42), None);

        let b = tracker.start_new_thread(None, 42);
        assert_ne!(a, b);
        assert_eq!(tracker.get_thread_or_null(42), Some(b));
    }

    #[test]
    fn test_end_thread_unknown_tid_is_silent() {
        let (storage, mut tracker) = new_tracker();
        tracker.end_thread(100, 7777);
        assert_eq!(storage.borrow().threads().len(), 1);
    }

    #[test]
    fn test_end_main_thread_ends_process() {
        let (storage, mut tracker) = new_tracker();
        let utid = tracker.update_thread(20, 20);
        let upid = storage.borrow().threads().upid(utid).unwrap();

        tracker.end_thread(500, 20);
        assert_eq!(storage.borrow().processes().end_ts(upid), Some(500));
        // The pid is free again: the next sighting allocates a new process.
        let new_upid = tracker.get_or_create_process(20);
        assert_ne!(new_upid, upid);
    }

    #[test]
    fn test_end_worker_thread_keeps_process_alive() {
        let (storage, mut tracker) = new_tracker();
        tracker.update_thread(20, 20);
        let worker = tracker.update_thread(21, 20);
        let upid = storage.borrow().threads().upid(worker).unwrap();

        tracker.end_thread(500, 21);
        assert_eq!(storage.borrow().processes().end_ts(upid), None);
        assert_eq!(tracker.get_or_create_process(20), upid);
    }

    #[test]
    fn test_update_thread_binds_process_and_main_flag() {
        let (storage, mut tracker) = new_tracker();
        let main = tracker.update_thread(10, 10);
        let worker = tracker.update_thread(11, 10);

        let storage = storage.borrow();
        let upid = storage.threads().upid(main).unwrap();
        assert_eq!(storage.threads().upid(worker), Some(upid));
        assert_eq!(storage.threads().is_main_thread(main), Some(true));
        assert_eq!(storage.threads().is_main_thread(worker), Some(false));
    }

    #[test]
    fn test_update_thread_same_pid_is_stable() {
        let (_, mut tracker) = new_tracker();
        let a = tracker.update_thread(11, 10);
        let b = tracker.update_thread(11, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn test_get_or_create_process_is_idempotent() {
        let (_, mut tracker) = new_tracker();
        let a = tracker.get_or_create_process(123);
        let b = tracker.get_or_create_process(123);
        assert_eq!(a, b);
    }

    #[test]
    fn test_thread_name_priority_gate() {
        let (storage, mut tracker) = new_tracker();
        let high = storage.borrow_mut().intern("from-process-tree");
        let low = storage.borrow_mut().intern("from-ftrace");

        let utid = tracker.update_thread_name(30, high, ThreadNamePriority::ProcessTree);
        tracker.update_thread_name_by_utid(utid, low, ThreadNamePriority::FtraceCommit);
        assert_eq!(storage.borrow().threads().name(utid), Some(high));

        // Equal priority overwrites.
        tracker.update_thread_name_by_utid(utid, low, ThreadNamePriority::ProcessTree);
        assert_eq!(storage.borrow().threads().name(utid), Some(low));
    }

    #[test]
    fn test_null_thread_name_is_ignored() {
        let (storage, mut tracker) = new_tracker();
        let name = storage.borrow_mut().intern("real-name");
        let utid = tracker.update_thread_name(30, name, ThreadNamePriority::ProcessTree);

        tracker.update_thread_name_by_utid(
            utid,
            StringId::NULL,
            ThreadNamePriority::TraceProcessorConstant,
        );
        assert_eq!(storage.borrow().threads().name(utid), Some(name));
    }

    #[test]
    fn test_main_thread_rename_renames_process() {
        let (storage, mut tracker) = new_tracker();
        let upid = tracker.get_or_create_process(40);
        let name = storage.borrow_mut().intern("renamed");

        tracker.update_thread_name_and_maybe_process_name(
            40,
            name,
            ThreadNamePriority::FtraceCommit,
        );
        assert_eq!(storage.borrow().processes().name(upid), Some(name));
    }

    #[test]
    fn test_worker_thread_rename_leaves_process_alone() {
        let (storage, mut tracker) = new_tracker();
        let upid = tracker.get_or_create_process(40);
        tracker.update_thread(41, 40);
        let name = storage.borrow_mut().intern("worker-name");

        tracker.update_thread_name_and_maybe_process_name(
            41,
            name,
            ThreadNamePriority::FtraceCommit,
        );
        assert_eq!(storage.borrow().processes().name(upid), None);
    }

    #[test]
    fn test_associate_threads_before_process_arrives() {
        let (storage, mut tracker) = new_tracker();
        let a = tracker.start_new_thread(None, 7);
        let b = tracker.start_new_thread(None, 8);
        tracker.associate_threads(a, b);

        // Nothing known yet.
        assert_eq!(storage.borrow().threads().upid(a), None);
        assert_eq!(storage.borrow().threads().upid(b), None);

        tracker.update_thread(7, 100);
        let upid = tracker.get_or_create_process(100);
        assert_eq!(storage.borrow().threads().upid(a), Some(upid));
        assert_eq!(storage.borrow().threads().upid(b), Some(upid));
        assert!(tracker.pending_assocs.is_empty());
    }

    #[test]
    fn test_association_is_transitive() {
        let (storage, mut tracker) = new_tracker();
        let a = tracker.start_new_thread(None, 7);
        let b = tracker.start_new_thread(None, 8);
        let c = tracker.start_new_thread(None, 9);
        tracker.associate_threads(a, b);
        tracker.associate_threads(b, c);

        // Binding one member of the chain pulls in all of them.
        tracker.update_thread(9, 100);
        let upid = tracker.get_or_create_process(100);
        let storage = storage.borrow();
        assert_eq!(storage.threads().upid(a), Some(upid));
        assert_eq!(storage.threads().upid(b), Some(upid));
        assert_eq!(storage.threads().upid(c), Some(upid));
        assert!(tracker.pending_assocs.is_empty());
    }

    #[test]
    fn test_associate_with_one_side_bound_resolves_immediately() {
        let (storage, mut tracker) = new_tracker();
        let bound = tracker.update_thread(50, 100);
        let unbound = tracker.start_new_thread(None, 51);
        tracker.associate_threads(bound, unbound);

        let upid = storage.borrow().threads().upid(bound).unwrap();
        assert_eq!(storage.borrow().threads().upid(unbound), Some(upid));
        assert!(tracker.pending_assocs.is_empty());
    }

    #[test]
    fn test_conflicting_association_is_dropped() {
        let (storage, mut tracker) = new_tracker();
        let a = tracker.update_thread(1, 100);
        let b = tracker.update_thread(2, 200);
        let upid_a = storage.borrow().threads().upid(a);
        let upid_b = storage.borrow().threads().upid(b);

        tracker.associate_threads(a, b);

        assert_eq!(storage.borrow().threads().upid(a), upid_a);
        assert_eq!(storage.borrow().threads().upid(b), upid_b);
        assert_eq!(storage.borrow().stat(Stat::ProcessTrackerErrors), 1);
        assert!(tracker.pending_assocs.is_empty());
    }

    #[test]
    fn test_start_new_process_overrides_pid() {
        let (storage, mut tracker) = new_tracker();
        let old_main = tracker.update_thread(50, 50);
        let old_worker = tracker.update_thread(51, 50);
        let old_upid = storage.borrow().threads().upid(old_main).unwrap();

        let name = storage.borrow_mut().intern("new-exec");
        let new_upid =
            tracker.start_new_process(None, None, 50, name, ThreadNamePriority::ProcessTree);
        assert_ne!(new_upid, old_upid);

        // Threads of the overridden process are implicitly dead.
        assert!(!tracker.is_thread_alive(old_worker));
        assert!(!tracker.is_thread_alive(old_main));
        assert_eq!(tracker.get_thread_or_null(51), None);
    }

    #[test]
    fn test_start_new_process_writes_name_and_start_ts() {
        let (storage, mut tracker) = new_tracker();
        let name = storage.borrow_mut().intern("child");
        let upid = tracker.start_new_process(
            Some(1000),
            None,
            77,
            name,
            ThreadNamePriority::TraceProcessorConstant,
        );

        let storage = storage.borrow();
        assert_eq!(storage.processes().start_ts(upid), Some(1000));
        assert_eq!(storage.processes().name(upid), Some(name));
        let main_utid = storage.threads().len() as Utid - 1;
        assert_eq!(storage.threads().name(main_utid), Some(name));
        assert_eq!(storage.threads().start_ts(main_utid), Some(1000));
    }

    #[test]
    fn test_parent_linked_immediately_when_known() {
        let (storage, mut tracker) = new_tracker();
        let parent_utid = tracker.update_thread(10, 10);
        let parent_upid = storage.borrow().threads().upid(parent_utid).unwrap();

        let name = storage.borrow_mut().intern("child");
        let child = tracker.start_new_process(None, Some(10), 20, name, ThreadNamePriority::Other);
        assert_eq!(storage.borrow().processes().parent_upid(child), Some(parent_upid));
        assert!(tracker.pending_parent_assocs.is_empty());
    }

    #[test]
    fn test_parent_link_deferred_until_parent_binds() {
        let (storage, mut tracker) = new_tracker();
        // Parent thread exists but its process is unknown.
        tracker.start_new_thread(None, 10);
        let name = storage.borrow_mut().intern("child");
        let child = tracker.start_new_process(None, Some(10), 20, name, ThreadNamePriority::Other);
        assert_eq!(storage.borrow().processes().parent_upid(child), None);
        assert_eq!(tracker.pending_parent_assocs.len(), 1);

        // The parent learns its process; the child link resolves with it.
        tracker.update_thread(10, 100);
        let parent_upid = tracker.get_or_create_process(100);
        assert_eq!(storage.borrow().processes().parent_upid(child), Some(parent_upid));
        assert!(tracker.pending_parent_assocs.is_empty());
    }

    #[test]
    fn test_set_process_metadata() {
        let (storage, mut tracker) = new_tracker();
        let upid = tracker.set_process_metadata(100, Some(50), "cat", "/bin/cat /tmp/f");

        let parent_upid = tracker.get_or_create_process(50);
        let storage = storage.borrow();
        assert_eq!(storage.string(storage.processes().name(upid).unwrap()), "cat");
        assert_eq!(
            storage.string(storage.processes().cmdline(upid).unwrap()),
            "/bin/cat /tmp/f"
        );
        assert_eq!(storage.processes().parent_upid(upid), Some(parent_upid));
    }

    #[test]
    fn test_set_process_uid_derives_appid() {
        let (storage, mut tracker) = new_tracker();
        let upid = tracker.get_or_create_process(200);
        tracker.set_process_uid(upid, 1010123);

        let storage = storage.borrow();
        assert_eq!(storage.processes().uid(upid), Some(1010123));
        assert_eq!(storage.processes().android_appid(upid), Some(10123));
    }

    #[test]
    fn test_if_unset_setters() {
        let (storage, mut tracker) = new_tracker();
        let upid = tracker.get_or_create_process(200);
        let first = storage.borrow_mut().intern("first");
        let second = storage.borrow_mut().intern("second");

        tracker.set_process_name_if_unset(upid, first);
        tracker.set_process_name_if_unset(upid, second);
        tracker.set_start_ts_if_unset(upid, 100);
        tracker.set_start_ts_if_unset(upid, 200);

        let storage = storage.borrow();
        assert_eq!(storage.processes().name(upid), Some(first));
        assert_eq!(storage.processes().start_ts(upid), Some(100));
    }

    #[test]
    fn test_namespace_resolution() {
        let (_, mut tracker) = new_tracker();
        tracker.update_namespaced_process(100, vec![100, 1]);
        tracker.update_namespaced_thread(100, 101, vec![101, 2]);

        assert_eq!(tracker.resolve_namespaced_tid(100, 1), Some(100));
        assert_eq!(tracker.resolve_namespaced_tid(100, 2), Some(101));
        assert_eq!(tracker.resolve_namespaced_tid(100, 3), None);
    }

    #[test]
    fn test_namespace_resolution_misses() {
        let (_, mut tracker) = new_tracker();
        assert_eq!(tracker.resolve_namespaced_tid(0, 1), None);
        assert_eq!(tracker.resolve_namespaced_tid(999, 1), None);

        // Re-registering a process drops its indexed threads.
        tracker.update_namespaced_process(100, vec![100, 1]);
        tracker.update_namespaced_thread(100, 101, vec![101, 2]);
        tracker.update_namespaced_process(100, vec![100, 1]);
        assert_eq!(tracker.resolve_namespaced_tid(100, 2), None);
    }

    #[test]
    fn test_trusted_pid_sideband() {
        let (_, mut tracker) = new_tracker();
        assert_eq!(tracker.get_trusted_pid(0xabcd), None);

        tracker.update_trusted_pid(1234, 0xabcd);
        assert_eq!(tracker.get_trusted_pid(0xabcd), Some(1234));

        // Last write wins on uuid collision.
        tracker.update_trusted_pid(5678, 0xabcd);
        assert_eq!(tracker.get_trusted_pid(0xabcd), Some(5678));
    }

    #[test]
    fn test_idle_process_install() {
        let (storage, mut tracker) = new_tracker();
        tracker.set_pid_zero_is_upid_zero_idle_process();

        assert_eq!(tracker.get_thread_or_null(0), Some(0));
        assert_eq!(tracker.get_or_create_process(0), 0);
        let storage = storage.borrow();
        assert_eq!(storage.string(storage.threads().name(0).unwrap()), "swapper");
    }

    #[test]
    fn test_tid_zero_without_idle_install_gets_fresh_utid() {
        let (storage, mut tracker) = new_tracker();
        let utid = tracker.update_thread(0, 0);
        assert_ne!(utid, 0);
        assert_ne!(storage.borrow().threads().upid(utid), Some(0));
    }

    #[test]
    fn test_notify_end_of_file_flushes_args() {
        let (storage, mut tracker) = new_tracker();
        let upid = tracker.get_or_create_process(10);
        let key = storage.borrow_mut().intern("android_appid");

        tracker
            .add_args_to(upid)
            .add_arg(key, key, ArgValue::Int(10123));
        assert!(storage.borrow().args().is_empty());

        tracker.notify_end_of_file();
        assert_eq!(storage.borrow().args().len(), 1);
        assert_eq!(storage.borrow().args().rows()[0].upid, upid);
    }
}

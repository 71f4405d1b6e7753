//! In-memory trace storage shared by all ingesters in a session.
//!
//! Threads and processes are stored columnar: every row is identified by a
//! dense index (utid/upid) handed out at insert time, and each column keeps
//! its own vector of slots. Row 0 of both tables is reserved at construction
//! for the idle (swapper) process so that embedders can special-case it.

use std::collections::HashMap;

/// Unique thread ID: dense index into the thread table. Never recycled.
pub type Utid = u32;

/// Unique process ID: dense index into the process table. Never recycled.
pub type Upid = u32;

/// An interned string identifier.
///
/// `StringId::NULL` (id 0, the empty string) plays the role of "no string";
/// interning the empty string always yields it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId(u32);

impl StringId {
    pub const NULL: StringId = StringId(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// String interning pool. Strings are stored once and referenced by index,
/// giving O(1) equality downstream.
#[derive(Default)]
pub struct StringPool {
    strings: Vec<String>,
    index: HashMap<String, StringId>,
}

impl StringPool {
    fn new() -> Self {
        let mut pool = StringPool::default();
        // Reserve id 0 for the null/empty string.
        pool.strings.push(String::new());
        pool.index.insert(String::new(), StringId::NULL);
        pool
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = StringId(self.strings.len() as u32);
        self.strings.push(s.to_owned());
        self.index.insert(s.to_owned(), id);
        id
    }

    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.0 as usize]
    }
}

/// Row passed to [`ThreadTable::insert`]. Columns not present here
/// (`end_ts`, `name`) start out unset.
#[derive(Clone, Debug, Default)]
pub struct ThreadRow {
    pub tid: u32,
    pub start_ts: Option<i64>,
    pub upid: Option<Upid>,
    pub is_main_thread: Option<bool>,
}

/// Append-only columnar thread table.
#[derive(Default)]
pub struct ThreadTable {
    tid: Vec<u32>,
    start_ts: Vec<Option<i64>>,
    end_ts: Vec<Option<i64>>,
    name: Vec<Option<StringId>>,
    upid: Vec<Option<Upid>>,
    is_main_thread: Vec<Option<bool>>,
}

impl ThreadTable {
    pub fn insert(&mut self, row: ThreadRow) -> Utid {
        let utid = self.tid.len() as Utid;
        self.tid.push(row.tid);
        self.start_ts.push(row.start_ts);
        self.end_ts.push(None);
        self.name.push(None);
        self.upid.push(row.upid);
        self.is_main_thread.push(row.is_main_thread);
        utid
    }

    pub fn len(&self) -> usize {
        self.tid.len()
    }

    pub fn tid(&self, utid: Utid) -> u32 {
        self.tid[utid as usize]
    }

    pub fn start_ts(&self, utid: Utid) -> Option<i64> {
        self.start_ts[utid as usize]
    }

    pub fn set_start_ts(&mut self, utid: Utid, ts: i64) {
        self.start_ts[utid as usize] = Some(ts);
    }

    pub fn end_ts(&self, utid: Utid) -> Option<i64> {
        self.end_ts[utid as usize]
    }

    pub fn set_end_ts(&mut self, utid: Utid, ts: i64) {
        self.end_ts[utid as usize] = Some(ts);
    }

    pub fn name(&self, utid: Utid) -> Option<StringId> {
        self.name[utid as usize]
    }

    pub fn set_name(&mut self, utid: Utid, name: StringId) {
        self.name[utid as usize] = Some(name);
    }

    pub fn upid(&self, utid: Utid) -> Option<Upid> {
        self.upid[utid as usize]
    }

    pub fn set_upid(&mut self, utid: Utid, upid: Upid) {
        self.upid[utid as usize] = Some(upid);
    }

    pub fn is_main_thread(&self, utid: Utid) -> Option<bool> {
        self.is_main_thread[utid as usize]
    }

    pub fn set_is_main_thread(&mut self, utid: Utid, is_main: bool) {
        self.is_main_thread[utid as usize] = Some(is_main);
    }
}

/// Row passed to [`ProcessTable::insert`]. All other columns start unset.
#[derive(Clone, Debug, Default)]
pub struct ProcessRow {
    pub pid: u32,
}

/// Append-only columnar process table.
#[derive(Default)]
pub struct ProcessTable {
    pid: Vec<u32>,
    start_ts: Vec<Option<i64>>,
    end_ts: Vec<Option<i64>>,
    name: Vec<Option<StringId>>,
    cmdline: Vec<Option<StringId>>,
    parent_upid: Vec<Option<Upid>>,
    uid: Vec<Option<u32>>,
    android_appid: Vec<Option<u32>>,
}

impl ProcessTable {
    pub fn insert(&mut self, row: ProcessRow) -> Upid {
        let upid = self.pid.len() as Upid;
        self.pid.push(row.pid);
        self.start_ts.push(None);
        self.end_ts.push(None);
        self.name.push(None);
        self.cmdline.push(None);
        self.parent_upid.push(None);
        self.uid.push(None);
        self.android_appid.push(None);
        upid
    }

    pub fn len(&self) -> usize {
        self.pid.len()
    }

    pub fn pid(&self, upid: Upid) -> u32 {
        self.pid[upid as usize]
    }

    pub fn start_ts(&self, upid: Upid) -> Option<i64> {
        self.start_ts[upid as usize]
    }

    pub fn set_start_ts(&mut self, upid: Upid, ts: i64) {
        self.start_ts[upid as usize] = Some(ts);
    }

    pub fn end_ts(&self, upid: Upid) -> Option<i64> {
        self.end_ts[upid as usize]
    }

    pub fn set_end_ts(&mut self, upid: Upid, ts: i64) {
        self.end_ts[upid as usize] = Some(ts);
    }

    pub fn name(&self, upid: Upid) -> Option<StringId> {
        self.name[upid as usize]
    }

    pub fn set_name(&mut self, upid: Upid, name: StringId) {
        self.name[upid as usize] = Some(name);
    }

    pub fn cmdline(&self, upid: Upid) -> Option<StringId> {
        self.cmdline[upid as usize]
    }

    pub fn set_cmdline(&mut self, upid: Upid, cmdline: StringId) {
        self.cmdline[upid as usize] = Some(cmdline);
    }

    pub fn parent_upid(&self, upid: Upid) -> Option<Upid> {
        self.parent_upid[upid as usize]
    }

    pub fn set_parent_upid(&mut self, upid: Upid, parent: Upid) {
        self.parent_upid[upid as usize] = Some(parent);
    }

    pub fn uid(&self, upid: Upid) -> Option<u32> {
        self.uid[upid as usize]
    }

    pub fn set_uid(&mut self, upid: Upid, uid: u32) {
        self.uid[upid as usize] = Some(uid);
    }

    pub fn android_appid(&self, upid: Upid) -> Option<u32> {
        self.android_appid[upid as usize]
    }

    pub fn set_android_appid(&mut self, upid: Upid, appid: u32) {
        self.android_appid[upid as usize] = Some(appid);
    }
}

/// Value of a single process argument.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    Int(i64),
    Str(StringId),
    Bool(bool),
}

/// One row of the flat args table.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgRow {
    pub upid: Upid,
    pub flat_key: StringId,
    pub key: StringId,
    pub value: ArgValue,
}

/// Flat append-only args table, fed by the args sidecar at flush time.
#[derive(Default)]
pub struct ArgTable {
    rows: Vec<ArgRow>,
}

impl ArgTable {
    pub fn insert(&mut self, row: ArgRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[ArgRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Counters for soft errors and other ingestion anomalies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stat {
    /// Contradictory thread association requests that were dropped.
    ProcessTrackerErrors,
}

/// Storage context shared between the tracker and the other ingesters of a
/// session. Mutated from a single thread only; share it as
/// `Rc<RefCell<TraceStorage>>`.
pub struct TraceStorage {
    threads: ThreadTable,
    processes: ProcessTable,
    args: ArgTable,
    strings: StringPool,
    stats: HashMap<Stat, u64>,
}

impl TraceStorage {
    /// Create storage with the reserved idle rows in place: utid 0 is tid 0
    /// belonging to upid 0, which is pid 0. Linux ingesters bind tid/pid 0
    /// to these via the tracker's idle-process install; other trace types
    /// leave them alone so a real tid-0 event gets a fresh utid.
    pub fn new() -> Self {
        let mut storage = TraceStorage {
            threads: ThreadTable::default(),
            processes: ProcessTable::default(),
            args: ArgTable::default(),
            strings: StringPool::new(),
            stats: HashMap::new(),
        };
        storage.threads.insert(ThreadRow {
            tid: 0,
            start_ts: None,
            upid: Some(0),
            is_main_thread: Some(true),
        });
        storage.processes.insert(ProcessRow { pid: 0 });
        storage
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn threads_mut(&mut self) -> &mut ThreadTable {
        &mut self.threads
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut ProcessTable {
        &mut self.processes
    }

    pub fn args(&self) -> &ArgTable {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut ArgTable {
        &mut self.args
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        self.strings.intern(s)
    }

    pub fn string(&self, id: StringId) -> &str {
        self.strings.get(id)
    }

    pub fn increment_stat(&mut self, stat: Stat) {
        *self.stats.entry(stat).or_insert(0) += 1;
    }

    pub fn stat(&self, stat: Stat) -> u64 {
        self.stats.get(&stat).copied().unwrap_or(0)
    }
}

impl Default for TraceStorage {
    fn default() -> Self {
        Self::new()
    }
}

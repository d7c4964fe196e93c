//! Remote handle resolution: open the owning process, duplicate the handle
//! into this process, ask the duplicate for its kernel object name.
//!
//! Every step can fail for an individual handle, and on a normal system most
//! handles in protected processes do. Those failures come back as
//! [`ResolveError`] for the caller to skip over; nothing here aborts a pass.
//!
//! The name query itself can block forever inside the kernel (a pipe with a
//! pending synchronous read is the classic case), so it runs on a worker
//! thread and is raced against a timeout. A worker stuck past the timeout is
//! abandoned together with the duplicate it holds, and a fresh worker takes
//! over. The abandoned duplicate is closed if the stuck call ever returns and
//! leaked otherwise; forcing it closed while the call is in flight is not safe.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{HandleFailure, ResolveError};
use crate::system::table::{HandleTableEntry, TypeTable};

/// Access masks of handles whose name query is known to hang (synchronous
/// named pipes and similar). They are skipped without being duplicated.
pub const BLOCKING_ACCESS_MASKS: [u32; 4] = [0x0012_019F, 0x001A_019F, 0x0012_0189, 0x0010_0000];

/// A handle duplicated into this process. Dropping it closes the duplicate.
pub trait NamedObject: Send + 'static {
    /// The kernel object name, e.g. `\Device\HarddiskVolume3\Windows\x.dll`.
    fn query_name(&self) -> Result<String, HandleFailure>;
}

/// Access to other processes' handles.
pub trait HandleBroker {
    /// An open process. Dropping it closes the process handle.
    type Process;
    type Duplicate: NamedObject;

    fn open_process(&self, pid: u32) -> Result<Self::Process, ResolveError>;

    fn duplicate(
        &self,
        process: &Self::Process,
        entry: &HandleTableEntry,
    ) -> Result<Self::Duplicate, ResolveError>;
}

/// A handle whose kernel object name is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandle {
    pub entry: HandleTableEntry,
    pub nt_path: String,
    pub handle_type: String,
}

/// Per-pass resolution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub process_unavailable: usize,
    pub handle_unavailable: usize,
    pub timed_out: usize,
    pub cache_hits: usize,
}

// ─── Name query worker ───────────────────────────────────────────────────────

type NameResult = Result<String, HandleFailure>;

struct NameWorker<D> {
    jobs: mpsc::Sender<D>,
    results: mpsc::Receiver<NameResult>,
}

impl<D: NamedObject> NameWorker<D> {
    fn spawn() -> std::io::Result<Self> {
        let (jobs, job_rx) = mpsc::channel::<D>();
        let (result_tx, results) = mpsc::channel();

        thread::Builder::new()
            .name("lockscan-name-query".to_string())
            .spawn(move || {
                for duplicate in job_rx {
                    let name = duplicate.query_name();
                    drop(duplicate);
                    if result_tx.send(name).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self { jobs, results })
    }

    /// Query `duplicate` on the worker. The flag in the error is set when the
    /// worker is no longer usable (stuck or gone) and must be replaced.
    fn query(&self, duplicate: D, timeout: Duration) -> Result<String, (HandleFailure, bool)> {
        // A failed send hands the duplicate back inside the error, which
        // closes it here on drop
        if self.jobs.send(duplicate).is_err() {
            return Err((HandleFailure::QueryFailed, true));
        }
        match self.results.recv_timeout(timeout) {
            Ok(Ok(name)) => Ok(name),
            Ok(Err(failure)) => Err((failure, false)),
            Err(RecvTimeoutError::Timeout) => Err((HandleFailure::TimedOut, true)),
            Err(RecvTimeoutError::Disconnected) => Err((HandleFailure::QueryFailed, true)),
        }
    }
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// Resolves handle table entries to object names for one pass.
///
/// Process handles are opened once per pid and closed when the resolver is
/// dropped. Names are cached by object address, so every further handle to
/// an already-resolved object skips duplication entirely.
pub struct Resolver<'a, B: HandleBroker> {
    broker: &'a B,
    types: &'a TypeTable,
    timeout: Duration,
    worker: Option<NameWorker<B::Duplicate>>,
    processes: HashMap<u32, Option<B::Process>>,
    names: HashMap<usize, String>,
    stats: ResolveStats,
}

impl<'a, B: HandleBroker> Resolver<'a, B> {
    pub fn new(broker: &'a B, types: &'a TypeTable, timeout: Duration) -> Self {
        Self {
            broker,
            types,
            timeout,
            worker: None,
            processes: HashMap::new(),
            names: HashMap::new(),
            stats: ResolveStats::default(),
        }
    }

    pub fn stats(&self) -> ResolveStats {
        self.stats
    }

    pub fn resolve(&mut self, entry: &HandleTableEntry) -> Result<ResolvedHandle, ResolveError> {
        let result = self.resolve_uncounted(entry);
        match &result {
            Ok(_) => {}
            Err(ResolveError::ProcessUnavailable { .. }) => self.stats.process_unavailable += 1,
            Err(ResolveError::HandleUnavailable { reason, .. }) => {
                self.stats.handle_unavailable += 1;
                if *reason == HandleFailure::TimedOut {
                    self.stats.timed_out += 1;
                }
            }
        }
        result
    }

    fn resolve_uncounted(&mut self, entry: &HandleTableEntry) -> Result<ResolvedHandle, ResolveError> {
        let unavailable = |reason| ResolveError::HandleUnavailable {
            pid: entry.pid,
            handle: entry.handle,
            reason,
        };

        if entry.object != 0 {
            if let Some(nt_path) = self.names.get(&entry.object) {
                self.stats.cache_hits += 1;
                return Ok(ResolvedHandle {
                    entry: *entry,
                    nt_path: nt_path.clone(),
                    handle_type: self.types.label(entry.type_code),
                });
            }
        }

        if BLOCKING_ACCESS_MASKS.contains(&entry.granted_access) {
            return Err(unavailable(HandleFailure::UnsafeAccessMask));
        }

        let broker = self.broker;
        let process = match self.processes.entry(entry.pid) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => slot.insert(match broker.open_process(entry.pid) {
                Ok(process) => Some(process),
                Err(err) => {
                    debug!("{err}");
                    None
                }
            }),
        };
        let process = process
            .as_ref()
            .ok_or(ResolveError::ProcessUnavailable { pid: entry.pid })?;

        let duplicate = broker.duplicate(process, entry)?;
        let nt_path = self.query_name(duplicate).map_err(|reason| {
            if reason == HandleFailure::TimedOut {
                warn!(
                    "abandoned name query for handle {:#x} in process {} after {:?}",
                    entry.handle, entry.pid, self.timeout
                );
            }
            unavailable(reason)
        })?;
        if nt_path.is_empty() {
            return Err(unavailable(HandleFailure::Unnamed));
        }

        if entry.object != 0 {
            self.names.insert(entry.object, nt_path.clone());
        }
        Ok(ResolvedHandle {
            entry: *entry,
            nt_path,
            handle_type: self.types.label(entry.type_code),
        })
    }

    fn query_name(&mut self, duplicate: B::Duplicate) -> Result<String, HandleFailure> {
        if self.worker.is_none() {
            match NameWorker::spawn() {
                Ok(worker) => self.worker = Some(worker),
                Err(err) => {
                    warn!("could not start name query worker: {err}");
                    return Err(HandleFailure::QueryFailed);
                }
            }
        }
        let worker = self.worker.as_ref().ok_or(HandleFailure::QueryFailed)?;

        match worker.query(duplicate, self.timeout) {
            Ok(name) => Ok(name),
            Err((failure, replace)) => {
                if replace {
                    // Dropping the sender lets the old thread exit once its
                    // current call returns, if it ever does
                    self.worker = None;
                }
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    const BLOCKING_HANDLE: usize = 0xdead;

    struct FakeDuplicate {
        handle: usize,
        closed: Arc<AtomicUsize>,
    }

    impl NamedObject for FakeDuplicate {
        fn query_name(&self) -> Result<String, HandleFailure> {
            match self.handle {
                BLOCKING_HANDLE => loop {
                    thread::park();
                },
                0 => Ok(String::new()),
                h => Ok(format!("\\Device\\HarddiskVolume1\\file{h}.txt")),
            }
        }
    }

    impl Drop for FakeDuplicate {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeBroker {
        denied_pids: Vec<u32>,
        undupable: Vec<usize>,
        opened: AtomicUsize,
        duplicated: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    impl HandleBroker for FakeBroker {
        type Process = u32;
        type Duplicate = FakeDuplicate;

        fn open_process(&self, pid: u32) -> Result<u32, ResolveError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.denied_pids.contains(&pid) {
                Err(ResolveError::ProcessUnavailable { pid })
            } else {
                Ok(pid)
            }
        }

        fn duplicate(&self, pid: &u32, entry: &HandleTableEntry) -> Result<FakeDuplicate, ResolveError> {
            if self.undupable.contains(&entry.handle) {
                return Err(ResolveError::HandleUnavailable {
                    pid: *pid,
                    handle: entry.handle,
                    reason: HandleFailure::DuplicateFailed,
                });
            }
            self.duplicated.fetch_add(1, Ordering::SeqCst);
            Ok(FakeDuplicate {
                handle: entry.handle,
                closed: Arc::clone(&self.closed),
            })
        }
    }

    fn entry(pid: u32, handle: usize, object: usize) -> HandleTableEntry {
        HandleTableEntry {
            pid,
            handle,
            type_code: 37,
            object,
            granted_access: 0x0012_0089,
            attributes: 0,
        }
    }

    fn types() -> TypeTable {
        TypeTable::from_names([(37, "File")])
    }

    #[test]
    fn resolves_name_and_type_label() {
        let broker = FakeBroker::default();
        let types = types();
        let mut resolver = Resolver::new(&broker, &types, Duration::from_millis(200));

        let resolved = resolver.resolve(&entry(7, 0x44, 0x1000)).unwrap();
        assert_eq!(resolved.nt_path, "\\Device\\HarddiskVolume1\\file68.txt");
        assert_eq!(resolved.handle_type, "File");
        assert_eq!(resolved.entry.pid, 7);
    }

    #[test]
    fn duplicates_are_closed_after_each_query() {
        let broker = FakeBroker::default();
        let types = types();
        let mut resolver = Resolver::new(&broker, &types, Duration::from_millis(200));
        for i in 1..=5 {
            resolver.resolve(&entry(7, i * 4, 0x1000 + i)).unwrap();
        }
        assert_eq!(broker.closed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn unavailable_process_is_opened_once_and_skipped() {
        let broker = FakeBroker {
            denied_pids: vec![4],
            ..FakeBroker::default()
        };
        let types = types();
        let mut resolver = Resolver::new(&broker, &types, Duration::from_millis(200));

        for handle in [4, 8, 12] {
            let err = resolver.resolve(&entry(4, handle, handle)).unwrap_err();
            assert_eq!(err, ResolveError::ProcessUnavailable { pid: 4 });
        }
        assert_eq!(broker.opened.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.stats().process_unavailable, 3);
    }

    #[test]
    fn failed_duplicate_is_skipped() {
        let broker = FakeBroker {
            undupable: vec![0x10],
            ..FakeBroker::default()
        };
        let types = types();
        let mut resolver = Resolver::new(&broker, &types, Duration::from_millis(200));

        let err = resolver.resolve(&entry(9, 0x10, 1)).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::HandleUnavailable { reason: HandleFailure::DuplicateFailed, .. }
        ));
        assert!(resolver.resolve(&entry(9, 0x14, 2)).is_ok());
    }

    #[test]
    fn blocking_access_mask_is_never_duplicated() {
        let broker = FakeBroker::default();
        let types = types();
        let mut resolver = Resolver::new(&broker, &types, Duration::from_millis(200));

        let mut pipe = entry(9, 0x20, 3);
        pipe.granted_access = 0x0012_019F;
        let err = resolver.resolve(&pipe).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::HandleUnavailable { reason: HandleFailure::UnsafeAccessMask, .. }
        ));
        assert_eq!(broker.duplicated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unnamed_object_is_skipped() {
        let broker = FakeBroker::default();
        let types = types();
        let mut resolver = Resolver::new(&broker, &types, Duration::from_millis(200));
        let err = resolver.resolve(&entry(9, 0, 5)).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::HandleUnavailable { reason: HandleFailure::Unnamed, .. }
        ));
    }

    #[test]
    fn shared_object_is_duplicated_once() {
        let broker = FakeBroker::default();
        let types = types();
        let mut resolver = Resolver::new(&broker, &types, Duration::from_millis(200));

        let first = resolver.resolve(&entry(10, 0x40, 0xfeed)).unwrap();
        let second = resolver.resolve(&entry(20, 0x80, 0xfeed)).unwrap();
        assert_eq!(first.nt_path, second.nt_path);
        assert_eq!(second.entry.pid, 20);
        assert_eq!(broker.duplicated.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.stats().cache_hits, 1);
    }

    #[test]
    fn hung_query_does_not_stall_the_rest() {
        let broker = FakeBroker::default();
        let types = types();
        let timeout = Duration::from_millis(200);
        let mut resolver = Resolver::new(&broker, &types, timeout);

        let mut entries: Vec<_> = (1..=99).map(|i| entry(30, i * 4, 0x1000 + i)).collect();
        entries.insert(50, entry(30, BLOCKING_HANDLE, 0x9999));

        let started = Instant::now();
        let resolved: Vec<_> = entries.iter().filter_map(|e| resolver.resolve(e).ok()).collect();
        let elapsed = started.elapsed();

        assert_eq!(resolved.len(), 99);
        assert_eq!(resolver.stats().timed_out, 1);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(2), "took {elapsed:?}");
    }
}

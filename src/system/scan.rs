//! The lock scan pipeline.
//!
//! handle table -> file-type filter -> pid filter -> remote resolution ->
//! device translation -> correlation with the target paths.
//!
//! Everything runs on the caller's thread except the per-handle name query
//! (see [`resolver`](crate::system::resolver)).

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, info};

use crate::config::{CancelPolicy, ScanConfig};
use crate::error::{ScanError, Stage};
use crate::system::buffer::{BufferGrower, QueryStatus};
use crate::system::correlate::{correlate, FileHandleInfo, ProcessDirectory, TargetPath, TranslatedHandle};
use crate::system::devices::{DeviceMap, VolumeSource};
use crate::system::filter::{filter, HandleFilter};
use crate::system::resolver::{HandleBroker, Resolver};
use crate::system::table::{parse_handle_table, HandleTableEntry, TypeTable};

// ─── Sources ─────────────────────────────────────────────────────────────────

/// Raw access to the system-wide tables. Each call fills `buffer` the way the
/// OS would and reports whether it fit.
pub trait HandleSource {
    fn query_handles(&self, buffer: &mut [u8]) -> QueryStatus;
    fn query_types(&self, buffer: &mut [u8]) -> QueryStatus;
}

/// A handle source replaying fixed table blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySource {
    pub handles: Vec<u8>,
    pub types: Vec<u8>,
}

impl MemorySource {
    fn copy(block: &[u8], buffer: &mut [u8]) -> QueryStatus {
        if buffer.len() < block.len() {
            return QueryStatus::TooSmall {
                required: Some(block.len()),
            };
        }
        buffer[..block.len()].copy_from_slice(block);
        QueryStatus::Complete {
            written: block.len(),
        }
    }
}

impl HandleSource for MemorySource {
    fn query_handles(&self, buffer: &mut [u8]) -> QueryStatus {
        Self::copy(&self.handles, buffer)
    }

    fn query_types(&self, buffer: &mut [u8]) -> QueryStatus {
        Self::copy(&self.types, buffer)
    }
}

// ─── Cancellation ────────────────────────────────────────────────────────────

/// Cooperative cancellation, checked between handle table entries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─── Options and report ──────────────────────────────────────────────────────

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Only look at handles owned by these processes.
    pub process_ids: Option<HashSet<u32>>,
    /// Overrides `ScanConfig::handle_timeout` for this call.
    pub handle_timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Entries in the system handle table.
    pub table_entries: usize,
    /// Entries left after type and pid filtering.
    pub candidates: usize,
    pub process_unavailable: usize,
    pub handle_unavailable: usize,
    pub timed_out: usize,
    /// Names with no mounted drive behind them.
    pub unresolved: usize,
    /// Matches whose process exited before it could be named.
    pub stale: usize,
    pub matched: usize,
    pub elapsed: Duration,
}

/// Result of one pass.
///
/// An empty `handles` means no lock was seen, not that none exists: the
/// system keeps changing after the table was read.
#[derive(Debug, Clone)]
pub struct LockReport {
    pub handles: Vec<FileHandleInfo>,
    /// Set when the pass was cancelled under `CancelPolicy::ReturnPartial`.
    pub partial: bool,
    pub stats: ScanStats,
    pub scanned_at: DateTime<Local>,
}

impl LockReport {
    /// Distinct locking process ids.
    pub fn pids(&self) -> BTreeSet<u32> {
        self.handles.iter().map(FileHandleInfo::pid).collect()
    }
}

// ─── Scanner ─────────────────────────────────────────────────────────────────

pub struct LockScanner<S, B, V, P> {
    source: S,
    broker: B,
    volumes: V,
    processes: P,
    config: ScanConfig,
    // Probed on first use, type codes are fixed until reboot
    types: Option<TypeTable>,
}

impl<S, B, V, P> LockScanner<S, B, V, P>
where
    S: HandleSource,
    B: HandleBroker,
    V: VolumeSource,
    P: ProcessDirectory,
{
    pub fn new(source: S, broker: B, volumes: V, processes: P, config: ScanConfig) -> Self {
        Self {
            source,
            broker,
            volumes,
            processes,
            config,
            types: None,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Read and parse the system handle table.
    pub fn read_table(&self) -> Result<Vec<HandleTableEntry>, ScanError> {
        let grower = BufferGrower::from_config(&self.config);
        let bytes = grower.acquire(Stage::HandleTable, |buf| self.source.query_handles(buf))?;
        parse_handle_table(&bytes)
    }

    /// The object type table, probed once per scanner.
    pub fn type_table(&mut self) -> Result<&TypeTable, ScanError> {
        if self.types.is_none() {
            let grower = BufferGrower::from_config(&self.config);
            let bytes = grower.acquire(Stage::TypeTable, |buf| self.source.query_types(buf))?;
            let table = TypeTable::parse(&bytes)?;
            debug!("probed {} object types", table.len());
            self.types = Some(table);
        }
        self.types
            .as_ref()
            .ok_or_else(|| ScanError::parse(Stage::TypeTable, "type table unavailable"))
    }

    /// Find every process holding a file handle at or beneath any of `targets`.
    pub fn find_locks<T: AsRef<str>>(
        &mut self,
        targets: &[T],
        options: &ScanOptions,
    ) -> Result<LockReport, ScanError> {
        let started = Instant::now();
        let scanned_at = Local::now();
        let mut stats = ScanStats::default();

        let targets: Vec<TargetPath> = targets
            .iter()
            .filter_map(|t| TargetPath::new(t.as_ref()))
            .collect();
        if targets.is_empty() {
            return Ok(LockReport {
                handles: Vec::new(),
                partial: false,
                stats,
                scanned_at,
            });
        }

        self.type_table()?;
        let types = match &self.types {
            Some(types) => types,
            None => return Err(ScanError::parse(Stage::TypeTable, "type table unavailable")),
        };
        let file_codes = types.codes_for(&self.config.file_type_names);
        if file_codes.is_empty() {
            return Err(ScanError::parse(
                Stage::TypeTable,
                format!("no object type named {}", self.config.file_type_names.join(" or ")),
            ));
        }

        let table = self.read_table()?;
        stats.table_entries = table.len();

        let mut handle_filter = HandleFilter::new().with_type_codes(file_codes);
        handle_filter.process_ids = options.process_ids.clone();
        let candidates = filter(&table, &handle_filter);
        drop(table);
        stats.candidates = candidates.len();

        let devices = DeviceMap::build(&self.volumes)?;
        let timeout = options.handle_timeout.unwrap_or(self.config.handle_timeout);
        let mut resolver = Resolver::new(&self.broker, types, timeout);

        let mut translated = Vec::new();
        let mut cancelled = false;
        for entry in &candidates {
            if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                cancelled = true;
                break;
            }
            let Ok(resolved) = resolver.resolve(entry) else {
                continue;
            };
            match devices.translate(&resolved.nt_path) {
                Some(file_path) => translated.push(TranslatedHandle {
                    entry: resolved.entry,
                    nt_path: resolved.nt_path,
                    file_path,
                    handle_type: resolved.handle_type,
                }),
                None => stats.unresolved += 1,
            }
        }

        let resolve_stats = resolver.stats();
        drop(resolver);
        stats.process_unavailable = resolve_stats.process_unavailable;
        stats.handle_unavailable = resolve_stats.handle_unavailable;
        stats.timed_out = resolve_stats.timed_out;

        if cancelled && self.config.cancel_policy == CancelPolicy::Discard {
            info!("scan cancelled, discarding {} resolved handles", translated.len());
            return Err(ScanError::Cancelled {
                collected: translated.len(),
            });
        }

        let (handles, correlate_stats) = correlate(&translated, &targets, &mut self.processes);
        stats.matched = correlate_stats.matched;
        stats.stale = correlate_stats.stale;
        stats.elapsed = started.elapsed();

        info!(
            "scanned {} handles ({} candidates) in {:?}: {} locks, {} timed out{}",
            stats.table_entries,
            stats.candidates,
            stats.elapsed,
            stats.matched,
            stats.timed_out,
            if cancelled { ", cancelled" } else { "" }
        );

        Ok(LockReport {
            handles,
            partial: cancelled,
            stats,
            scanned_at,
        })
    }
}

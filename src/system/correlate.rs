//! Matching resolved handle paths against the paths the caller cares about,
//! and building the final per-handle records.

use std::collections::{HashMap, HashSet};

use log::debug;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::RecordError;
use crate::system::table::HandleTableEntry;

// ─── Result record ───────────────────────────────────────────────────────────

/// A process holding an open handle to a file under one of the target paths.
///
/// Owns no OS resources; the duplicate used to learn the path is closed
/// before the record is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandleInfo {
    process_name: String,
    file_path: String,
    nt_path: String,
    handle_type: String,
    entry: HandleTableEntry,
}

impl FileHandleInfo {
    /// Build a record, rejecting a blank file path, NT path or handle type.
    pub fn new(
        entry: HandleTableEntry,
        process_name: impl Into<String>,
        file_path: impl Into<String>,
        nt_path: impl Into<String>,
        handle_type: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let file_path = file_path.into();
        let nt_path = nt_path.into();
        let handle_type = handle_type.into();
        if file_path.trim().is_empty() {
            return Err(RecordError::EmptyFilePath);
        }
        if nt_path.trim().is_empty() {
            return Err(RecordError::EmptyNtPath);
        }
        if handle_type.trim().is_empty() {
            return Err(RecordError::EmptyHandleType);
        }
        Ok(Self {
            process_name: process_name.into(),
            file_path,
            nt_path,
            handle_type,
            entry,
        })
    }

    pub fn pid(&self) -> u32 {
        self.entry.pid
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn nt_path(&self) -> &str {
        &self.nt_path
    }

    /// Kernel object type name, e.g. `File`.
    pub fn handle_type(&self) -> &str {
        &self.handle_type
    }

    pub fn entry(&self) -> &HandleTableEntry {
        &self.entry
    }
}

// ─── Process names ───────────────────────────────────────────────────────────

/// Live process name lookup.
pub trait ProcessDirectory {
    /// `None` when the process has exited (or never existed).
    fn process_name(&mut self, pid: u32) -> Option<String>;
}

/// Process names via `sysinfo`, refreshed per lookup so exited processes
/// are noticed.
pub struct SysinfoProcesses {
    sys: System,
}

impl SysinfoProcesses {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SysinfoProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessDirectory for SysinfoProcesses {
    fn process_name(&mut self, pid: u32) -> Option<String> {
        let pid = Pid::from_u32(pid);
        self.sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.sys
            .process(pid)
            .map(|p| p.name().to_string_lossy().into_owned())
    }
}

// ─── Path matching ───────────────────────────────────────────────────────────

/// Case-fold, use `\` as the only separator and drop trailing separators.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('/', "\\").to_lowercase();
    path.trim_end_matches('\\').to_string()
}

/// A path to check for locks. Matches itself and everything beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPath {
    original: String,
    normalized: String,
}

impl TargetPath {
    /// `None` for a blank path, which would otherwise match everything.
    pub fn new(path: impl Into<String>) -> Option<Self> {
        let original = path.into();
        let normalized = normalize_path(&original);
        if normalized.is_empty() {
            return None;
        }
        Some(Self { original, normalized })
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// `C:\App` covers `C:\App` and `C:\App\lib.dll`, not `C:\Application`.
    pub fn covers(&self, path: &str) -> bool {
        let path = normalize_path(path);
        match path.strip_prefix(&self.normalized) {
            Some(rest) => rest.is_empty() || rest.starts_with('\\'),
            None => false,
        }
    }
}

// ─── Correlation ─────────────────────────────────────────────────────────────

/// A resolved handle after device translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedHandle {
    pub entry: HandleTableEntry,
    pub nt_path: String,
    pub file_path: String,
    pub handle_type: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelateStats {
    pub matched: usize,
    pub stale: usize,
}

/// Keep the handles under any target, one record per (process, handle).
///
/// Process names are looked up live; a handle whose process has exited by
/// now is dropped as stale.
pub fn correlate(
    handles: &[TranslatedHandle],
    targets: &[TargetPath],
    processes: &mut impl ProcessDirectory,
) -> (Vec<FileHandleInfo>, CorrelateStats) {
    let mut stats = CorrelateStats::default();
    let mut records = Vec::new();
    let mut seen: HashSet<(u32, usize)> = HashSet::new();
    let mut names: HashMap<u32, Option<String>> = HashMap::new();

    for handle in handles {
        if !targets.iter().any(|t| t.covers(&handle.file_path)) {
            continue;
        }
        if !seen.insert((handle.entry.pid, handle.entry.handle)) {
            continue;
        }

        let pid = handle.entry.pid;
        let name = names
            .entry(pid)
            .or_insert_with(|| processes.process_name(pid))
            .clone();
        let Some(name) = name else {
            debug!("dropping handle {:#x}: process {pid} has exited", handle.entry.handle);
            stats.stale += 1;
            continue;
        };

        match FileHandleInfo::new(
            handle.entry,
            name,
            handle.file_path.clone(),
            handle.nt_path.clone(),
            handle.handle_type.clone(),
        ) {
            Ok(record) => records.push(record),
            Err(err) => debug!("dropping handle {:#x} in process {pid}: {err}", handle.entry.handle),
        }
    }

    stats.matched = records.len();
    (records, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProcesses(HashMap<u32, &'static str>);

    impl ProcessDirectory for FakeProcesses {
        fn process_name(&mut self, pid: u32) -> Option<String> {
            self.0.get(&pid).map(|n| n.to_string())
        }
    }

    fn entry(pid: u32, handle: usize) -> HandleTableEntry {
        HandleTableEntry {
            pid,
            handle,
            type_code: 37,
            object: handle,
            granted_access: 0,
            attributes: 0,
        }
    }

    fn translated(pid: u32, handle: usize, path: &str) -> TranslatedHandle {
        TranslatedHandle {
            entry: entry(pid, handle),
            nt_path: format!("\\Device\\HarddiskVolume1{}", &path[2..]),
            file_path: path.to_string(),
            handle_type: "File".to_string(),
        }
    }

    #[test]
    fn record_rejects_each_blank_field() {
        let e = entry(1, 4);
        assert_eq!(
            FileHandleInfo::new(e, "app.exe", "", "\\Device\\X\\a", "File"),
            Err(RecordError::EmptyFilePath)
        );
        assert_eq!(
            FileHandleInfo::new(e, "app.exe", "C:\\a", "  ", "File"),
            Err(RecordError::EmptyNtPath)
        );
        assert_eq!(
            FileHandleInfo::new(e, "app.exe", "C:\\a", "\\Device\\X\\a", ""),
            Err(RecordError::EmptyHandleType)
        );
        let ok = FileHandleInfo::new(e, "app.exe", "C:\\a", "\\Device\\X\\a", "File").unwrap();
        assert_eq!(ok.pid(), 1);
        assert_eq!(ok.file_path(), "C:\\a");
    }

    #[test]
    fn target_covers_itself_and_descendants() {
        let target = TargetPath::new("C:\\App").unwrap();
        assert!(target.covers("C:\\App"));
        assert!(target.covers("C:\\App\\lib.dll"));
        assert!(target.covers("c:\\app\\SUB\\x"));
        assert!(!target.covers("C:\\Application\\x.dll"));
        assert!(!target.covers("D:\\App\\lib.dll"));
    }

    #[test]
    fn trailing_and_forward_separators_are_normalized() {
        let target = TargetPath::new("c:/app/").unwrap();
        assert!(target.covers("C:\\App\\lib.dll"));
        assert_eq!(target.as_str(), "c:/app/");
    }

    #[test]
    fn drive_root_covers_whole_drive() {
        let target = TargetPath::new("C:\\").unwrap();
        assert!(target.covers("C:\\Windows\\x.dll"));
        assert!(!target.covers("D:\\x"));
    }

    #[test]
    fn blank_target_is_rejected() {
        assert_eq!(TargetPath::new("  "), None);
        assert_eq!(TargetPath::new("\\\\"), None);
    }

    #[test]
    fn correlate_keeps_matches_and_names_them() {
        let mut processes = FakeProcesses([(10, "editor.exe"), (20, "setup.exe")].into_iter().collect());
        let handles = vec![
            translated(10, 4, "C:\\Other\\notes.txt"),
            translated(20, 8, "C:\\App\\lib.dll"),
            translated(20, 12, "C:\\Application\\x.dll"),
        ];
        let targets = vec![TargetPath::new("C:\\App").unwrap()];

        let (records, stats) = correlate(&handles, &targets, &mut processes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid(), 20);
        assert_eq!(records[0].process_name(), "setup.exe");
        assert_eq!(records[0].handle_type(), "File");
        assert_eq!(stats, CorrelateStats { matched: 1, stale: 0 });
    }

    #[test]
    fn exited_process_is_dropped_as_stale() {
        let mut processes = FakeProcesses(HashMap::new());
        let handles = vec![translated(99, 4, "C:\\App\\lib.dll")];
        let targets = vec![TargetPath::new("C:\\App").unwrap()];

        let (records, stats) = correlate(&handles, &targets, &mut processes);
        assert!(records.is_empty());
        assert_eq!(stats.stale, 1);
    }

    #[test]
    fn duplicate_pairs_are_reported_once() {
        let mut processes = FakeProcesses([(20, "setup.exe")].into_iter().collect());
        let handles = vec![
            translated(20, 8, "C:\\App\\lib.dll"),
            translated(20, 8, "C:\\App\\lib.dll"),
            translated(20, 16, "C:\\App\\lib.dll"),
        ];
        let targets = vec![
            TargetPath::new("C:\\App").unwrap(),
            TargetPath::new("C:\\App\\lib.dll").unwrap(),
        ];
        let (records, _) = correlate(&handles, &targets, &mut processes);
        let handles: Vec<usize> = records.iter().map(|r| r.entry().handle).collect();
        assert_eq!(handles, vec![8, 16]);
    }

    #[test]
    fn sysinfo_finds_the_current_process() {
        let mut processes = SysinfoProcesses::new();
        let name = processes.process_name(std::process::id());
        assert!(name.is_some_and(|n| !n.is_empty()));
    }
}

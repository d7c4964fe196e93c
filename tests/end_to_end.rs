//! Full pass over synthetic system tables through the public API.

use std::collections::HashMap;

use lockscan::system::scan::MemorySource;
use lockscan::system::table::{encode_handle_table, encode_type_table};
use lockscan::system::window::select_windows;
use lockscan::{
    candidate_pids, HandleBroker, HandleFailure, HandleTableEntry, LockScanner, NamedObject,
    ProcessDirectory, ResolveError, ScanConfig, ScanError, ScanOptions, Stage, VolumeSource,
    WindowInfo, WindowInfoOptions,
};

const FILE: u16 = 37;
const EVENT: u16 = 16;

struct Duplicate(String);

impl NamedObject for Duplicate {
    fn query_name(&self) -> Result<String, HandleFailure> {
        Ok(self.0.clone())
    }
}

struct Broker(HashMap<(u32, usize), &'static str>);

impl HandleBroker for Broker {
    type Process = u32;
    type Duplicate = Duplicate;

    fn open_process(&self, pid: u32) -> Result<u32, ResolveError> {
        Ok(pid)
    }

    fn duplicate(&self, pid: &u32, entry: &HandleTableEntry) -> Result<Duplicate, ResolveError> {
        self.0
            .get(&(*pid, entry.handle))
            .map(|name| Duplicate(name.to_string()))
            .ok_or(ResolveError::HandleUnavailable {
                pid: *pid,
                handle: entry.handle,
                reason: HandleFailure::DuplicateFailed,
            })
    }
}

struct Volumes;

impl VolumeSource for Volumes {
    fn mounted_drives(&self) -> Result<Vec<(String, String)>, ScanError> {
        Ok(vec![
            ("C:".into(), "\\Device\\HarddiskVolume1".into()),
            ("D:".into(), "\\Device\\HarddiskVolume2".into()),
        ])
    }
}

struct Processes;

impl ProcessDirectory for Processes {
    fn process_name(&mut self, pid: u32) -> Option<String> {
        match pid {
            10 => Some("explorer.exe".into()),
            20 => Some("setup.exe".into()),
            _ => None,
        }
    }
}

fn entry(pid: u32, handle: usize, type_code: u16) -> HandleTableEntry {
    HandleTableEntry {
        pid,
        handle,
        type_code,
        object: 0x8000_0000 + ((pid as usize) << 12) + handle,
        granted_access: 0x0012_0089,
        attributes: 0,
    }
}

fn scanner() -> LockScanner<MemorySource, Broker, Volumes, Processes> {
    let entries = [
        entry(10, 0x04, FILE),
        entry(10, 0x08, EVENT),
        entry(20, 0x0c, FILE),
        entry(20, 0x10, FILE),
    ];
    let names = [
        ((10, 0x04), "\\Device\\HarddiskVolume2\\Users\\notes.txt"),
        ((20, 0x0c), "\\Device\\HarddiskVolume1\\Locked\\f.txt"),
        ((20, 0x10), "\\Device\\Mup\\server\\share\\f.txt"),
    ];
    let source = MemorySource {
        handles: encode_handle_table(&entries),
        types: encode_type_table(&[(EVENT, "Event"), (FILE, "File")]),
    };
    LockScanner::new(
        source,
        Broker(names.into_iter().collect()),
        Volumes,
        Processes,
        ScanConfig::default(),
    )
}

#[test]
fn only_the_holding_process_is_reported() {
    let report = scanner()
        .find_locks(&["C:\\Locked"], &ScanOptions::default())
        .unwrap();

    assert_eq!(report.handles.len(), 1);
    let lock = &report.handles[0];
    assert_eq!(lock.pid(), 20);
    assert_eq!(lock.process_name(), "setup.exe");
    assert_eq!(lock.file_path(), "C:\\Locked\\f.txt");
    assert_eq!(lock.nt_path(), "\\Device\\HarddiskVolume1\\Locked\\f.txt");
    assert_eq!(lock.handle_type(), "File");
    assert!(!report.partial);

    assert_eq!(report.stats.table_entries, 4);
    assert_eq!(report.stats.candidates, 3);
    assert_eq!(report.stats.unresolved, 1);
    assert_eq!(report.stats.matched, 1);
}

#[test]
fn unlocked_path_reports_nothing() {
    let report = scanner()
        .find_locks(&["C:\\Free"], &ScanOptions::default())
        .unwrap();
    assert!(report.handles.is_empty());
    assert!(report.pids().is_empty());
}

#[test]
fn window_selection_narrows_the_scan() {
    let desktop = vec![
        WindowInfo {
            handle: 0x1001,
            title: "Setup Wizard".into(),
            pid: 20,
            process_name: "setup.exe".into(),
        },
        WindowInfo {
            handle: 0x1002,
            title: "Users".into(),
            pid: 10,
            process_name: "explorer.exe".into(),
        },
    ];
    let windows = select_windows(
        desktop,
        &WindowInfoOptions {
            parent_process_filter: Some(vec!["explorer".into()]),
            ..WindowInfoOptions::default()
        },
    );
    let options = ScanOptions {
        process_ids: Some(candidate_pids(&windows).into_iter().collect()),
        ..ScanOptions::default()
    };

    let report = scanner().find_locks(&["C:\\", "D:\\"], &options).unwrap();
    assert_eq!(report.pids().into_iter().collect::<Vec<_>>(), vec![10]);
    assert_eq!(report.handles[0].file_path(), "D:\\Users\\notes.txt");
}

#[test]
fn unreadable_table_is_fatal() {
    let mut scanner = LockScanner::new(
        MemorySource {
            handles: vec![0xff; 3],
            types: encode_type_table(&[(FILE, "File")]),
        },
        Broker(HashMap::new()),
        Volumes,
        Processes,
        ScanConfig::default(),
    );
    let err = scanner
        .find_locks(&["C:\\Locked"], &ScanOptions::default())
        .unwrap_err();
    assert!(matches!(err, ScanError::ParseError { stage: Stage::HandleTable, .. }));
    assert!(!err.is_retryable());
}

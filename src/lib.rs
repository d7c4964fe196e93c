//! lockscan: find which processes hold open handles to a file or directory.
//!
//! One pass reads the system handle table, keeps the file handles, asks each
//! owning process (through a duplicated handle) what the handle points at,
//! rewrites kernel device paths to drive-letter paths and keeps the ones at
//! or beneath the requested targets.
//!
//! Every OS touchpoint sits behind a trait ([`HandleSource`],
//! [`HandleBroker`], [`VolumeSource`], [`ProcessDirectory`]); the live
//! Windows implementations are in [`system::winapi`].

pub mod config;
pub mod error;
pub mod report;
pub mod system;

pub use config::{CancelPolicy, ScanConfig};
pub use error::{HandleFailure, RecordError, ResolveError, ScanError, Stage};
pub use system::correlate::{FileHandleInfo, ProcessDirectory, SysinfoProcesses};
pub use system::devices::{DeviceMap, VolumeSource};
pub use system::resolver::{HandleBroker, NamedObject};
pub use system::scan::{CancelToken, HandleSource, LockReport, LockScanner, ScanOptions, ScanStats};
pub use system::table::HandleTableEntry;
pub use system::window::{candidate_pids, WindowInfo, WindowInfoOptions};

#[cfg(windows)]
pub use system::winapi::NativeScanner;

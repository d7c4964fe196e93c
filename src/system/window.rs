//! Top-level window lookup, used to turn "the app whose window says X"
//! into a set of process ids to scan.

use std::collections::BTreeSet;

use log::warn;
use regex::{Regex, RegexBuilder};

use crate::system::correlate::ProcessDirectory;

/// Which windows to report. Every populated filter must match (AND);
/// `None` or an empty list places no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowInfoOptions {
    /// Case-insensitive regexes matched anywhere in the title; any may match.
    pub window_title_filter: Option<Vec<String>>,
    pub window_handle_filter: Option<Vec<isize>>,
    /// Owning process names, case-insensitive, `.exe` optional.
    pub parent_process_filter: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub handle: isize,
    pub title: String,
    pub pid: u32,
    pub process_name: String,
}

// ─── Filtering ───────────────────────────────────────────────────────────────

/// [`WindowInfoOptions`] with its title patterns compiled.
pub struct WindowFilter {
    titles: Vec<Regex>,
    titles_unmatchable: bool,
    handles: Vec<isize>,
    processes: Vec<String>,
}

fn strip_exe(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

impl WindowFilter {
    /// Invalid title patterns are skipped with a warning. A filter whose
    /// patterns all fail to compile matches nothing.
    pub fn new(options: &WindowInfoOptions) -> Self {
        let title_patterns = options.window_title_filter.as_deref().unwrap_or_default();
        let titles: Vec<Regex> = title_patterns
            .iter()
            .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!("ignoring window title pattern {p:?}: {err}");
                    None
                }
            })
            .collect();
        let titles_unmatchable = titles.is_empty() && !title_patterns.is_empty();

        Self {
            titles,
            titles_unmatchable,
            handles: options.window_handle_filter.clone().unwrap_or_default(),
            processes: options
                .parent_process_filter
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|n| strip_exe(n))
                .collect(),
        }
    }

    pub fn matches(&self, window: &WindowInfo) -> bool {
        if self.titles_unmatchable {
            return false;
        }
        if !self.titles.is_empty() && !self.titles.iter().any(|re| re.is_match(&window.title)) {
            return false;
        }
        if !self.handles.is_empty() && !self.handles.contains(&window.handle) {
            return false;
        }
        if !self.processes.is_empty() {
            let name = strip_exe(&window.process_name);
            if !self.processes.iter().any(|p| *p == name) {
                return false;
            }
        }
        true
    }
}

/// Keep the windows `options` selects, in their original order.
pub fn select_windows(windows: Vec<WindowInfo>, options: &WindowInfoOptions) -> Vec<WindowInfo> {
    let filter = WindowFilter::new(options);
    windows.into_iter().filter(|w| filter.matches(w)).collect()
}

/// Distinct owning process ids.
pub fn candidate_pids(windows: &[WindowInfo]) -> BTreeSet<u32> {
    windows.iter().map(|w| w.pid).collect()
}

// ─── Native enumeration ──────────────────────────────────────────────────────

/// Name the raw `(handle, title, pid)` triples from enumeration. Windows
/// with a blank title or an exited owner are dropped.
fn describe_windows(
    found: Vec<(isize, String, u32)>,
    processes: &mut impl ProcessDirectory,
) -> Vec<WindowInfo> {
    found
        .into_iter()
        .filter(|(_, title, _)| !title.trim().is_empty())
        .filter_map(|(handle, title, pid)| {
            let process_name = processes.process_name(pid)?;
            Some(WindowInfo { handle, title, pid, process_name })
        })
        .collect()
}

/// Titled top-level windows on the current desktop that `options` selects.
/// Hidden windows are included.
#[cfg(windows)]
pub fn enumerate_windows(
    options: &WindowInfoOptions,
    processes: &mut impl ProcessDirectory,
) -> Vec<WindowInfo> {
    use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowTextLengthW, GetWindowTextW, GetWindowThreadProcessId,
    };

    unsafe extern "system" fn collect(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let found = &mut *(lparam.0 as *mut Vec<(isize, String, u32)>);
        let len = GetWindowTextLengthW(hwnd);
        if len <= 0 {
            return BOOL(1);
        }
        let mut buf = vec![0u16; len as usize + 1];
        let copied = GetWindowTextW(hwnd, &mut buf);
        let title = String::from_utf16_lossy(&buf[..copied.max(0) as usize]);
        let mut pid: u32 = 0;
        GetWindowThreadProcessId(hwnd, Some(&mut pid as *mut u32));
        found.push((hwnd.0 as isize, title, pid));
        BOOL(1)
    }

    let mut found: Vec<(isize, String, u32)> = Vec::new();
    let result = unsafe { EnumWindows(Some(collect), LPARAM(&mut found as *mut _ as isize)) };
    if let Err(err) = result {
        warn!("EnumWindows failed: {err}");
    }

    select_windows(describe_windows(found, processes), options)
}

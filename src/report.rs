//! Plain-text rendering of a [`LockReport`] (lsof-style table plus summary).

use std::fmt::Write;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::system::scan::LockReport;

const PROCESS_COLUMN_MAX: usize = 28;
const TYPE_COLUMN_MAX: usize = 10;

/// Render the table, one row per handle. Empty when there are no handles.
pub fn render_table(report: &LockReport) -> String {
    if report.handles.is_empty() {
        return String::new();
    }

    let rows: Vec<[String; 4]> = report
        .handles
        .iter()
        .map(|h| {
            [
                h.pid().to_string(),
                truncate_width(h.process_name(), PROCESS_COLUMN_MAX),
                truncate_width(h.handle_type(), TYPE_COLUMN_MAX),
                h.file_path().to_string(),
            ]
        })
        .collect();

    let header = ["PID", "PROCESS", "TYPE", "PATH"];
    let mut widths = header.map(UnicodeWidthStr::width);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.width());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &header.map(str::to_string), &widths);
    push_row(&mut out, &widths.map(|w| "─".repeat(w)), &widths);
    for row in &rows {
        push_row(&mut out, row, &widths);
    }
    out
}

fn push_row(out: &mut String, cells: &[String; 4], widths: &[usize; 4]) {
    // PID right-aligned, last column unpadded
    let _ = write!(out, "{}{}  ", " ".repeat(widths[0] - cells[0].width()), cells[0]);
    for (cell, width) in cells[1..3].iter().zip(&widths[1..3]) {
        let _ = write!(out, "{}{}  ", cell, " ".repeat(width - cell.width()));
    }
    let _ = writeln!(out, "{}", cells[3]);
}

/// One-line summary, e.g. `2 handles in 1 process (scanned 14:03:11, 412 ms)`.
pub fn render_summary(report: &LockReport) -> String {
    let handles = report.handles.len();
    let processes = report.pids().len();
    let mut line = if handles == 0 {
        "no open handles found".to_string()
    } else {
        format!(
            "{} {} in {} {}",
            handles,
            plural(handles, "handle", "handles"),
            processes,
            plural(processes, "process", "processes"),
        )
    };
    let _ = write!(
        line,
        " (scanned {}, {} ms",
        report.scanned_at.format("%H:%M:%S"),
        report.stats.elapsed.as_millis()
    );
    let skipped = report.stats.process_unavailable + report.stats.handle_unavailable;
    if skipped > 0 {
        let _ = write!(line, ", {skipped} skipped");
    }
    if report.stats.timed_out > 0 {
        let _ = write!(line, ", {} timed out", report.stats.timed_out);
    }
    line.push(')');
    if report.partial {
        line.push_str(" [partial]");
    }
    line
}

fn plural<'a>(n: usize, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 {
        one
    } else {
        many
    }
}

/// Cut `s` to at most `max` terminal columns, ending in `...` when cut.
fn truncate_width(s: &str, max: usize) -> String {
    if s.width() <= max {
        return s.to_string();
    }
    let budget = max.saturating_sub(3);
    let mut used = 0;
    let mut truncated = String::new();
    for c in s.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        truncated.push(c);
    }
    truncated.push_str("...");
    truncated
}

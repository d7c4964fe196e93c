//! lockscan: list the processes holding files open under a path, so an
//! installer or a user knows what to close before replacing it.
//!
//! Exit codes:
//!   0  nothing holds a handle under the given paths
//!   1  at least one handle was found
//!   2  the scan could not be run

mod opts;

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use log::{error, info};
use simplelog::{ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger};

use lockscan::report::{render_summary, render_table};
use lockscan::{CancelToken, LockReport, ScanConfig, ScanOptions};

use opts::Opts;

fn main() -> ExitCode {
    let opts = opts::from_args();

    if let Err(err) = init_logging(&opts) {
        eprintln!("lockscan: failed to set up logging: {:#}", err);
    }

    let result = run(&opts);
    if let Err(err) = &result {
        error!("{:#}", err);
        eprintln!("lockscan: {:#}", err);
    }
    ExitCode::from(exit_code(&result))
}

/// 0 when nothing holds a handle, 1 when something does, 2 on failure
/// (including an interrupted scan whose results were discarded).
fn exit_code(result: &Result<Option<LockReport>>) -> u8 {
    match result {
        Ok(Some(report)) if !report.handles.is_empty() => 1,
        Ok(_) => 0,
        Err(_) => 2,
    }
}

fn init_logging(opts: &Opts) -> Result<()> {
    let level = opts.log_verbosity.level();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];
    if let Some(path) = &opts.log_file {
        let file = File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, Config::default(), file));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

/// `None` when there was nothing to scan.
fn run(opts: &Opts) -> Result<Option<LockReport>> {
    let mut config = ScanConfig::load();
    opts.apply(&mut config);

    if opts.write_config {
        let path = config.save().context("cannot write config file")?;
        info!("settings written to {}", path.display());
        println!("settings written to {}", path.display());
    }
    if opts.paths.is_empty() {
        return Ok(None);
    }

    let targets = opts
        .paths
        .iter()
        .map(|p| absolute(p))
        .collect::<Result<Vec<String>>>()?;

    let mut process_ids: HashSet<u32> = opts.pids.iter().copied().collect();
    if !opts.window_titles.is_empty() {
        let pids = window_pids(&opts.window_titles)?;
        if pids.is_empty() {
            println!("no window title matches {}", opts.window_titles.join(", "));
            return Ok(None);
        }
        process_ids.extend(pids);
    }
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());
    let options = scan_options(process_ids, cancel);

    let report = scan(config, &targets, &options)?;
    print!("{}", render_table(&report));
    println!("{}", render_summary(&report));
    Ok(Some(report))
}

fn scan_options(process_ids: HashSet<u32>, cancel: CancelToken) -> ScanOptions {
    ScanOptions {
        process_ids: (!process_ids.is_empty()).then_some(process_ids),
        cancel: Some(cancel),
        ..ScanOptions::default()
    }
}

/// The first Ctrl-C (or Ctrl-Break) cancels the scan; a second one falls
/// through to the default handler and ends the process.
#[cfg(windows)]
fn install_interrupt_handler(cancel: CancelToken) {
    use std::sync::OnceLock;

    use windows::Win32::Foundation::BOOL;
    use windows::Win32::System::Console::SetConsoleCtrlHandler;

    static CANCEL: OnceLock<CancelToken> = OnceLock::new();

    unsafe extern "system" fn on_ctrl(_ctrl_type: u32) -> BOOL {
        match CANCEL.get() {
            Some(cancel) if !cancel.is_cancelled() => {
                cancel.cancel();
                BOOL(1)
            }
            _ => BOOL(0),
        }
    }

    if CANCEL.set(cancel).is_err() {
        log::warn!("interrupt handler already installed");
        return;
    }
    if let Err(err) = unsafe { SetConsoleCtrlHandler(Some(on_ctrl), true) } {
        log::warn!("cannot install Ctrl-C handler, the scan cannot be interrupted: {err}");
    }
}

#[cfg(not(windows))]
fn install_interrupt_handler(_cancel: CancelToken) {}

fn absolute(path: &Path) -> Result<String> {
    let path: PathBuf = std::path::absolute(path)
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(windows)]
fn scan(config: ScanConfig, targets: &[String], options: &ScanOptions) -> Result<LockReport> {
    let mut scanner = lockscan::NativeScanner::native(config);
    scanner
        .find_locks(targets, options)
        .context("handle scan failed")
}

#[cfg(not(windows))]
fn scan(_config: ScanConfig, _targets: &[String], _options: &ScanOptions) -> Result<LockReport> {
    anyhow::bail!("handle scanning is only supported on Windows")
}

#[cfg(windows)]
fn window_pids(titles: &[String]) -> Result<Vec<u32>> {
    use lockscan::system::window::enumerate_windows;
    use lockscan::{candidate_pids, SysinfoProcesses, WindowInfoOptions};

    let options = WindowInfoOptions {
        window_title_filter: Some(titles.to_vec()),
        ..WindowInfoOptions::default()
    };
    let windows = enumerate_windows(&options, &mut SysinfoProcesses::new());
    for window in &windows {
        info!("window {:#x} {:?} belongs to {} ({})", window.handle, window.title, window.process_name, window.pid);
    }
    Ok(candidate_pids(&windows).into_iter().collect())
}

#[cfg(not(windows))]
fn window_pids(_titles: &[String]) -> Result<Vec<u32>> {
    anyhow::bail!("window lookup is only supported on Windows")
}

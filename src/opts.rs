//! Command-line options for the `lockscan` binary.

use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

use lockscan::{CancelPolicy, ScanConfig};

#[derive(StructOpt, Debug)]
#[structopt(name = "lockscan", about = "Lists the processes holding files open under the given paths.")]
pub struct Opts {
    #[structopt(name = "PATH", parse(from_os_str), required_unless = "write-config",
                help = "Files or directories to check; a directory covers everything beneath it")]
    pub paths: Vec<PathBuf>,

    #[structopt(long = "timeout-ms", name = "MILLIS",
                help = "Gives up on a single handle name query after this long")]
    pub timeout_ms: Option<u64>,

    #[structopt(long = "pid", name = "PID", number_of_values = 1,
                help = "Only looks at handles owned by this process (repeatable)")]
    pub pids: Vec<u32>,

    #[structopt(long = "window-title", name = "REGEX", number_of_values = 1,
                help = "Only looks at processes owning a window whose title matches (repeatable)")]
    pub window_titles: Vec<String>,

    #[structopt(long = "max-buffer-mib", name = "MIB",
                help = "Largest buffer a system table query may grow to")]
    pub max_buffer_mib: Option<usize>,

    #[structopt(long = "partial",
                help = "Reports what was found so far when interrupted instead of nothing")]
    pub partial: bool,

    #[structopt(long = "write-config",
                help = "Saves the effective settings to the config file")]
    pub write_config: bool,

    #[structopt(long = "log-verbosity", name = "LEVEL", default_value = "warn",
                help = "Specifies the level of log verbosity")]
    pub log_verbosity: Verbosity,

    #[structopt(long = "log-file", name = "FILE",
                help = "Also writes the log to the specified file")]
    pub log_file: Option<PathBuf>,
}

pub fn from_args() -> Opts {
    Opts::from_args()
}

impl Opts {
    /// Override loaded settings with whatever was given on the command line.
    pub fn apply(&self, config: &mut ScanConfig) {
        if let Some(ms) = self.timeout_ms {
            config.handle_timeout = Duration::from_millis(ms.clamp(10, 60_000));
        }
        if let Some(mib) = self.max_buffer_mib {
            config.max_buffer_bytes = mib.max(1).saturating_mul(1024 * 1024);
        }
        if self.partial {
            config.cancel_policy = CancelPolicy::ReturnPartial;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verbosity {
    level: log::LevelFilter,
}

impl Verbosity {
    pub fn level(&self) -> log::LevelFilter {
        self.level
    }
}

impl std::str::FromStr for Verbosity {
    type Err = String;

    fn from_str(string: &str) -> Result<Verbosity, String> {
        use log::LevelFilter::*;

        let level = match string {
            "quiet" => Off,
            "error" => Error,
            "warn" => Warn,
            "info" => Info,
            "debug" => Debug,
            "trace" => Trace,
            _ => return Err(format!("invalid verbosity choice '{}'", string)),
        };

        Ok(Verbosity { level })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        Opts::from_iter_safe(std::iter::once("lockscan").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn verbosity_names() {
        assert_eq!("quiet".parse::<Verbosity>().unwrap().level(), log::LevelFilter::Off);
        assert_eq!("trace".parse::<Verbosity>().unwrap().level(), log::LevelFilter::Trace);
        assert!("loud".parse::<Verbosity>().is_err());
    }

    #[test]
    fn defaults_leave_config_alone() {
        let opts = parse(&["C:\\App"]);
        assert_eq!(opts.log_verbosity.level(), log::LevelFilter::Warn);
        let mut config = ScanConfig::default();
        opts.apply(&mut config);
        assert_eq!(config, ScanConfig::default());
    }

    #[test]
    fn flags_override_config() {
        let opts = parse(&[
            "--timeout-ms", "900",
            "--max-buffer-mib", "64",
            "--partial",
            "--pid", "10",
            "--pid", "20",
            "C:\\App",
            "D:\\Data",
        ]);
        let mut config = ScanConfig::default();
        opts.apply(&mut config);
        assert_eq!(config.handle_timeout, Duration::from_millis(900));
        assert_eq!(config.max_buffer_bytes, 64 * 1024 * 1024);
        assert_eq!(config.cancel_policy, CancelPolicy::ReturnPartial);
        assert_eq!(opts.pids, vec![10, 20]);
        assert_eq!(opts.paths.len(), 2);
    }

    #[test]
    fn paths_are_required_unless_writing_config() {
        assert!(Opts::from_iter_safe(["lockscan"]).is_err());
        assert!(parse(&["--write-config"]).write_config);
    }
}

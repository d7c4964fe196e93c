//! Growable query buffers for system-information calls whose result size is
//! only known to the OS and may change between the size probe and the read.

use log::trace;

use crate::config::ScanConfig;
use crate::error::{ScanError, Stage};
use crate::system::table::POINTER_SIZE;

// ─── NTSTATUS values ─────────────────────────────────────────────────────────

pub const STATUS_SUCCESS: u32 = 0x0000_0000;
pub const STATUS_BUFFER_OVERFLOW: u32 = 0x8000_0005;
pub const STATUS_INFO_LENGTH_MISMATCH: u32 = 0xC000_0004;
pub const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
pub const STATUS_BUFFER_TOO_SMALL: u32 = 0xC000_0023;
pub const STATUS_PRIVILEGE_NOT_HELD: u32 = 0xC000_0061;

/// Outcome of one attempt to fill a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// The query succeeded and wrote `written` bytes.
    Complete { written: usize },
    /// The buffer was too small. `required` is the size the OS asked for, if any.
    TooSmall { required: Option<usize> },
    /// Insufficient privilege.
    Denied { status: u32 },
    /// Any other failure.
    Failed { status: u32 },
}

impl QueryStatus {
    /// Classify an NTSTATUS returned by an `Nt*Information` call.
    pub fn from_ntstatus(status: i32, return_length: u32, buffer_len: usize) -> Self {
        let status = status as u32;
        let reported = return_length as usize;
        match status {
            STATUS_INFO_LENGTH_MISMATCH | STATUS_BUFFER_TOO_SMALL | STATUS_BUFFER_OVERFLOW => {
                QueryStatus::TooSmall {
                    required: (reported > 0).then_some(reported),
                }
            }
            STATUS_ACCESS_DENIED | STATUS_PRIVILEGE_NOT_HELD => QueryStatus::Denied { status },
            // Success and informational codes have the top bit clear
            s if (s as i32) >= 0 => QueryStatus::Complete {
                written: if reported == 0 || reported > buffer_len {
                    buffer_len
                } else {
                    reported
                },
            },
            _ => QueryStatus::Failed { status },
        }
    }
}

/// Retries a size-probing query with a growing buffer until it fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGrower {
    pub initial: usize,
    pub max_bytes: usize,
    pub max_attempts: u32,
    pub margin: usize,
}

impl BufferGrower {
    pub fn from_config(cfg: &ScanConfig) -> Self {
        Self {
            initial: cfg.initial_buffer_bytes,
            max_bytes: cfg.max_buffer_bytes,
            max_attempts: cfg.max_attempts,
            margin: cfg.growth_margin_bytes,
        }
    }

    /// Sizing for one OBJECT_NAME_INFORMATION: a UNICODE_STRING header
    /// followed by at most `u16::MAX` bytes of name.
    pub fn for_object_name() -> Self {
        Self {
            initial: 1024,
            max_bytes: 2 * POINTER_SIZE + u16::MAX as usize + 1,
            max_attempts: 4,
            margin: 0,
        }
    }

    /// Run `query` until it completes, returning the bytes it wrote.
    ///
    /// The first call gets `initial` bytes (zero by default, which makes it a
    /// pure size probe). Each "too small" answer grows the buffer to the
    /// reported size plus `margin`, because the table can grow between the
    /// probe and the real read; without a usable report the buffer doubles.
    /// The buffer is an owned `Vec`, so it is released on every exit path,
    /// including a panic inside `query`.
    pub fn acquire<F>(&self, stage: Stage, mut query: F) -> Result<Vec<u8>, ScanError>
    where
        F: FnMut(&mut [u8]) -> QueryStatus,
    {
        let mut size = self.initial.min(self.max_bytes);
        let mut buffer: Vec<u8> = Vec::new();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            buffer.clear();
            buffer.resize(size, 0);

            match query(&mut buffer) {
                QueryStatus::Complete { written } => {
                    buffer.truncate(written.min(size));
                    trace!("{stage} query completed with {} bytes after {attempts} attempts", buffer.len());
                    return Ok(buffer);
                }
                QueryStatus::TooSmall { required } => {
                    let next = self.next_size(size, required);
                    trace!("{stage} query needs more room: {size} -> {next} bytes");
                    if next > self.max_bytes || attempts >= self.max_attempts {
                        return Err(ScanError::ResourceExhausted {
                            stage,
                            requested: next,
                            limit: self.max_bytes,
                            attempts,
                        });
                    }
                    size = next;
                }
                QueryStatus::Denied { status } => {
                    return Err(ScanError::QueryDenied { stage, status });
                }
                QueryStatus::Failed { status } => {
                    return Err(ScanError::QueryFailed { stage, status });
                }
            }
        }
    }

    fn next_size(&self, current: usize, required: Option<usize>) -> usize {
        let doubled = current.saturating_mul(2).max(self.margin).max(4096);
        match required {
            Some(required) if required > current => required.saturating_add(self.margin),
            _ => doubled,
        }
    }
}

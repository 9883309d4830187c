//! Process-wide page locking state.
//!
//! Limits on lockable memory are owned by the OS; handles never track them and
//! only surface them as `PageLockError::Permission`. These queries exist for
//! callers that want to inspect the budget up front.

use std::{fs, io};

use nix::{
    errno::Errno,
    sys::resource::{RLIM_INFINITY, Resource, getrlimit},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Failed reading process status: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed process status: {msg}")]
    Parse { msg: String },

    #[error("Generic runtime error ({errno}): {msg}")]
    RuntimeError { msg: String, errno: Errno },
}

/// `RLIMIT_MEMLOCK` in bytes, `None` meaning unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemlockLimit {
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

/// Returns the number of bytes currently locked by this process.
pub fn locked_bytes() -> Result<usize, StatusError> {
    let status = fs::read_to_string("/proc/self/status")?;
    parse_vm_lck(&status)
}

/// Returns the process' `RLIMIT_MEMLOCK`.
pub fn memlock_limit() -> Result<MemlockLimit, StatusError> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_MEMLOCK).map_err(|errno| StatusError::RuntimeError {
        msg: "getrlimit(RLIMIT_MEMLOCK) failed".into(),
        errno,
    })?;
    let finite = |limit: u64| (limit != RLIM_INFINITY).then_some(limit);
    Ok(MemlockLimit {
        soft: finite(soft),
        hard: finite(hard),
    })
}

fn parse_vm_lck(status: &str) -> Result<usize, StatusError> {
    let line = status
        .lines()
        .find_map(|line| line.strip_prefix("VmLck:"))
        .ok_or_else(|| StatusError::Parse {
            msg: "missing VmLck".into(),
        })?;
    let kib = line
        .trim()
        .strip_suffix("kB")
        .ok_or_else(|| StatusError::Parse {
            msg: format!("unexpected VmLck unit in {:?}", line),
        })?
        .trim()
        .parse::<usize>()
        .map_err(|err| StatusError::Parse {
            msg: format!("invalid VmLck value {:?}: {}", line, err),
        })?;
    kib.checked_mul(1024).ok_or_else(|| StatusError::Parse {
        msg: format!("VmLck {} kB overflows", kib),
    })
}

//! CPU and memory sampling for a process tree.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// `USER_HZ`, the unit of `utime`/`stime` in `/proc/<pid>/stat`. The kernel
/// fixes it at 100 on every Linux architecture regardless of `CONFIG_HZ`, so
/// it matches `sysconf(_SC_CLK_TCK)` without a libc call.
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// Cumulative resource usage of a process tree at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawSample {
    /// User plus system CPU time of the process and its descendants.
    pub cpu_time: Duration,
    /// Resident set size in KiB, summed over the tree.
    pub rss_kib: Option<u64>,
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("process {0} is gone")]
    ProcessGone(u32),

    #[error("cannot read process stats: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed process stats: {0}")]
    Parse(String),
}

/// Source of [`RawSample`]s for a pid.
pub trait ProcessSampler: Send + Sync {
    fn sample(&self, pid: u32) -> Result<RawSample, SampleError>;

    /// Pids of every live descendant of `pid`, used to kill a whole tree.
    fn descendants(&self, _pid: u32) -> Vec<u32> {
        Vec::new()
    }
}

/// Reads Linux procfs.
#[derive(Debug, Clone)]
pub struct ProcSampler {
    proc_root: PathBuf,
    include_descendants: bool,
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            include_descendants: true,
        }
    }
}

impl ProcSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample from an alternative procfs mount.
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            include_descendants: true,
        }
    }

    /// Only account for the pid itself.
    pub fn without_descendants(mut self) -> Self {
        self.include_descendants = false;
        self
    }

    fn read_stat(&self, pid: u32) -> Result<StatLine, SampleError> {
        let path = self.proc_root.join(pid.to_string()).join("stat");
        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SampleError::ProcessGone(pid),
            _ => SampleError::Io(e),
        })?;
        parse_stat(&content)
    }

    fn read_rss(&self, pid: u32) -> Option<u64> {
        let path = self.proc_root.join(pid.to_string()).join("status");
        let content = fs::read_to_string(path).ok()?;
        content
            .lines()
            .find_map(|line| line.strip_prefix("VmRSS:"))
            .and_then(parse_status_kib)
    }

    /// Every pid under the root whose parent chain reaches `pid`.
    fn descendant_stats(&self, pid: u32) -> Vec<(u32, StatLine)> {
        let mut children: HashMap<u32, Vec<(u32, StatLine)>> = HashMap::new();
        for candidate in list_pids(&self.proc_root) {
            if candidate == pid {
                continue;
            }
            // Processes exit between listing and reading; skip them.
            if let Ok(stat) = self.read_stat(candidate) {
                children.entry(stat.ppid).or_default().push((candidate, stat));
            }
        }

        let mut found = Vec::new();
        let mut frontier = vec![pid];
        while let Some(parent) = frontier.pop() {
            if let Some(kids) = children.remove(&parent) {
                for (child, stat) in kids {
                    frontier.push(child);
                    found.push((child, stat));
                }
            }
        }
        found
    }
}

impl ProcessSampler for ProcSampler {
    fn sample(&self, pid: u32) -> Result<RawSample, SampleError> {
        let root = self.read_stat(pid)?;
        let mut ticks = root.cpu_ticks;
        let mut rss = self.read_rss(pid);

        if self.include_descendants {
            for (child, stat) in self.descendant_stats(pid) {
                ticks = ticks.saturating_add(stat.cpu_ticks);
                if let Some(kib) = self.read_rss(child) {
                    rss = Some(rss.unwrap_or(0) + kib);
                }
            }
        }

        Ok(RawSample {
            cpu_time: ticks_to_duration(ticks),
            rss_kib: rss,
        })
    }

    fn descendants(&self, pid: u32) -> Vec<u32> {
        self.descendant_stats(pid)
            .into_iter()
            .map(|(child, _)| child)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatLine {
    ppid: u32,
    cpu_ticks: u64,
}

/// Parse `/proc/<pid>/stat`. The command name is parenthesised and may
/// contain spaces, so fields are counted from the last `)`.
fn parse_stat(content: &str) -> Result<StatLine, SampleError> {
    let (_, rest) = content
        .rsplit_once(')')
        .ok_or_else(|| SampleError::Parse("missing command terminator".to_string()))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state; ppid is field 4 of the full line, utime 14, stime 15.
    let field = |idx: usize, name: &str| -> Result<u64, SampleError> {
        fields
            .get(idx)
            .ok_or_else(|| SampleError::Parse(format!("missing {name}")))?
            .parse::<u64>()
            .map_err(|e| SampleError::Parse(format!("{name}: {e}")))
    };
    let ppid = field(1, "ppid")?;
    let utime = field(11, "utime")?;
    let stime = field(12, "stime")?;
    Ok(StatLine {
        ppid: ppid as u32,
        cpu_ticks: utime.saturating_add(stime),
    })
}

fn parse_status_kib(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}

fn ticks_to_duration(ticks: u64) -> Duration {
    let secs = ticks / CLOCK_TICKS_PER_SEC;
    let rem = ticks % CLOCK_TICKS_PER_SEC;
    Duration::from_secs(secs) + Duration::from_millis(rem * 1000 / CLOCK_TICKS_PER_SEC)
}

fn list_pids(proc_root: &Path) -> Vec<u32> {
    let Ok(entries) = fs::read_dir(proc_root) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .collect()
}

//! PID-file bookkeeping and process control for the background service.

use std::fs;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Outcome of a stop request.
#[derive(Debug, Eq, PartialEq)]
pub enum StopOutcome {
    /// Exited on SIGTERM within the grace period.
    Graceful,
    /// Needed a SIGKILL escalation.
    Killed,
}

pub fn read_pid(path: &Path) -> Option<i32> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

pub fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// The running service's PID, if any. Stale PID files (process gone) are
/// removed on the way.
pub fn probe(path: &Path) -> Option<i32> {
    let pid = read_pid(path)?;
    if is_alive(pid) {
        Some(pid)
    } else {
        let _ = fs::remove_file(path);
        None
    }
}

/// SIGTERM, wait up to `grace`, escalate to SIGKILL, remove the PID file.
pub fn stop(path: &Path, pid: i32, grace: Duration) -> io::Result<StopOutcome> {
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|err| io::Error::other(format!("failed to signal pid {pid}: {err}")))?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            let _ = fs::remove_file(path);
            return Ok(StopOutcome::Graceful);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    let _ = fs::remove_file(path);
    Ok(StopOutcome::Killed)
}

/// Resident set size in MiB from `/proc`, best-effort.
pub fn memory_rss_mib(pid: i32) -> Option<f64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib / 1024.0)
}

/// Last `count` lines of the log file.
pub fn tail_lines(path: &Path, count: usize) -> io::Result<Vec<String>> {
    let file = fs::File::open(path)?;
    let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
    let skip = lines.len().saturating_sub(count);
    Ok(lines.into_iter().skip(skip).collect())
}

/// Print the file as it grows, `tail -f` style. Runs until interrupted.
pub fn follow(path: &Path) -> io::Result<()> {
    let mut file = fs::File::open(path)?;
    let mut position = file.seek(SeekFrom::End(0))?;
    loop {
        let len = file.metadata()?.len();
        if len < position {
            // The sink rotated underneath us; reopen from the top.
            file = fs::File::open(path)?;
            position = 0;
        }
        if len > position {
            file.seek(SeekFrom::Start(position))?;
            let mut buf = String::new();
            file.read_to_string(&mut buf)?;
            position += buf.len() as u64;
            print!("{buf}");
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}

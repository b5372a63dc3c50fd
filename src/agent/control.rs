use std::io;

/// Signal-level control over a task's OS process.
///
/// `pid` is the task's process group leader. The preemption escalation only
/// talks to this trait, so other execution backends can plug in their own
/// notion of "ask nicely", "terminate" and "kill".
#[cfg_attr(test, mockall::automock)]
pub trait ProcessControl: Send + Sync {
    /// Cooperative "please checkpoint" request.
    fn soft_signal(&self, pid: u32) -> io::Result<()>;
    fn terminate(&self, pid: u32) -> io::Result<()>;
    fn kill(&self, pid: u32) -> io::Result<()>;
    /// Any probe error counts as "gone".
    fn is_alive(&self, pid: u32) -> bool;
}

/// SIGUSR1 / SIGTERM / SIGKILL delivered to the whole process group led by
/// `pid`, so shell wrappers and the workloads they start see the same signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixSignals;

impl UnixSignals {
    fn send(pid: u32, signal: libc::c_int) -> io::Result<()> {
        // pid 0 would address our own group.
        let pgid = libc::pid_t::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("bad pid {pid}")))?;

        if unsafe { libc::kill(-pgid, signal) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl ProcessControl for UnixSignals {
    fn soft_signal(&self, pid: u32) -> io::Result<()> {
        Self::send(pid, libc::SIGUSR1)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::send(pid, libc::SIGTERM)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::send(pid, libc::SIGKILL)
    }

    /// A group whose members are all zombies is gone: the leader may stay
    /// unreaped until its output pipes close.
    fn is_alive(&self, pid: u32) -> bool {
        Self::send(pid, 0).is_ok() && group_has_live_member(pid).unwrap_or(true)
    }
}

/// `None` when `/proc` cannot be listed.
fn group_has_live_member(pgid: u32) -> Option<bool> {
    let entries = std::fs::read_dir("/proc").ok()?;
    let live = entries.flatten().any(|entry| {
        let is_pid = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            return false;
        }
        std::fs::read_to_string(entry.path().join("stat"))
            .ok()
            .and_then(|stat| parse_stat(&stat))
            .is_some_and(|(state, pgrp)| pgrp == pgid && !matches!(state, 'Z' | 'X'))
    });
    Some(live)
}

/// State and process group from `/proc/<pid>/stat`.
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    // The command name may contain spaces and parentheses.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

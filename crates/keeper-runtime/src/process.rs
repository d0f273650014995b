//! OS process inspection and signalling.
//!
//! Everything outside [`crate::server::ServiceController`] refers to processes
//! by PID only. Nothing here owns a process.

use std::io;
use std::process::Command;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

/// How to ask a process to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM on Unix, `taskkill` without `/F` on Windows.
    Graceful,
    /// SIGKILL on Unix, `taskkill /F` on Windows.
    Forced,
}

/// A process as seen by the inspector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Executable path and arguments joined by spaces.
    pub command_line: String,
}

/// Read-only view of OS processes plus the ability to signal them by PID.
pub trait ProcessTable: Send + Sync {
    /// PIDs listening on `port`.
    fn pids_on_port(&self, port: u16) -> Vec<u32>;

    /// Command line of `pid`, if it exists.
    fn command_line(&self, pid: u32) -> Option<String>;

    /// All visible processes.
    fn processes(&self) -> Vec<ProcessEntry>;

    /// Whether `pid` is still alive.
    fn is_alive(&self, pid: u32) -> bool;

    /// Send a termination request to `pid`.
    fn terminate(&self, pid: u32, how: Termination) -> io::Result<()>;
}

/// [`ProcessTable`] backed by the real OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    pub fn new() -> Self {
        Self
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_exe(UpdateKind::Always)
    }
}

impl ProcessTable for SystemProcessTable {
    fn pids_on_port(&self, port: u16) -> Vec<u32> {
        let mut pids = listening_pids(port);
        pids.sort_unstable();
        pids.dedup();
        debug!("Port {} is held by PIDs {:?}", port, pids);
        pids
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            Self::refresh_kind(),
        );
        system.process(sys_pid).map(|p| join_command(p.cmd(), p.exe()))
    }

    fn processes(&self) -> Vec<ProcessEntry> {
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());
        system
            .processes()
            .iter()
            .map(|(pid, p)| ProcessEntry {
                pid: pid.as_u32(),
                command_line: join_command(p.cmd(), p.exe()),
            })
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        system.process(sys_pid).is_some()
    }

    fn terminate(&self, pid: u32, how: Termination) -> io::Result<()> {
        send_termination(pid, how)
    }
}

fn join_command(cmd: &[std::ffi::OsString], exe: Option<&std::path::Path>) -> String {
    if cmd.is_empty() {
        return exe.map(|e| e.display().to_string()).unwrap_or_default();
    }
    cmd.iter()
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deliver a termination request to `pid`.
#[cfg(unix)]
pub fn send_termination(pid: u32, how: Termination) -> io::Result<()> {
    let signal = match how {
        Termination::Graceful => libc::SIGTERM,
        Termination::Forced => libc::SIGKILL,
    };
    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Deliver a termination request to `pid`.
#[cfg(windows)]
pub fn send_termination(pid: u32, how: Termination) -> io::Result<()> {
    let pid_arg = pid.to_string();
    let mut command = Command::new("taskkill");
    command.args(["/PID", pid_arg.as_str(), "/T"]);
    if how == Termination::Forced {
        command.arg("/F");
    }
    let output = command.output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

#[cfg(unix)]
fn listening_pids(port: u16) -> Vec<u32> {
    let port_arg = format!("-iTCP:{}", port);
    if let Ok(output) = Command::new("lsof")
        .args(["-nP", port_arg.as_str(), "-sTCP:LISTEN", "-t"])
        .output()
    {
        // lsof exits 1 when nothing matches; only trust it when it ran cleanly.
        if output.status.success() || output.stderr.is_empty() {
            return parse_lsof_pids(&String::from_utf8_lossy(&output.stdout));
        }
    }

    let filter = format!("sport = :{}", port);
    match Command::new("ss")
        .args(["-H", "-ltnp", filter.as_str()])
        .output()
    {
        Ok(output) => parse_ss_pids(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            debug!("Neither lsof nor ss available: {}", e);
            Vec::new()
        }
    }
}

#[cfg(windows)]
fn listening_pids(port: u16) -> Vec<u32> {
    match Command::new("netstat").args(["-ano", "-p", "TCP"]).output() {
        Ok(output) => parse_netstat_pids(&String::from_utf8_lossy(&output.stdout), port),
        Err(e) => {
            debug!("netstat unavailable: {}", e);
            Vec::new()
        }
    }
}

/// Parse `lsof -t` output (one PID per line).
pub fn parse_lsof_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Parse `ss -ltnp` output, extracting every `pid=N`.
pub fn parse_ss_pids(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for line in output.lines() {
        let mut rest = line;
        while let Some(idx) = rest.find("pid=") {
            rest = &rest[idx + 4..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(pid) = digits.parse() {
                pids.push(pid);
            }
        }
    }
    pids
}

/// Parse `netstat -ano` output, keeping LISTENING rows whose local port is `port`.
pub fn parse_netstat_pids(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            if !cols[3].eq_ignore_ascii_case("LISTENING") || !cols[1].ends_with(&suffix) {
                return None;
            }
            cols[4].parse().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof() {
        assert_eq!(parse_lsof_pids("123\n456\n\n"), vec![123, 456]);
        assert!(parse_lsof_pids("").is_empty());
    }

    #[test]
    fn test_parse_ss() {
        let out = "LISTEN 0 4096 127.0.0.1:11434 0.0.0.0:* users:((\"ollama\",pid=4242,fd=3))\n\
                   LISTEN 0 4096 [::1]:11434 [::]:* users:((\"ollama\",pid=4242,fd=4),(\"ollama\",pid=4243,fd=4))";
        assert_eq!(parse_ss_pids(out), vec![4242, 4242, 4243]);
    }

    #[test]
    fn test_parse_netstat() {
        let out = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1000
  TCP    127.0.0.1:11434        0.0.0.0:0              LISTENING       5150
  TCP    127.0.0.1:11434        127.0.0.1:50000        ESTABLISHED     5150
  TCP    127.0.0.1:114340       0.0.0.0:0              LISTENING       6000
";
        assert_eq!(parse_netstat_pids(out, 11434), vec![5150]);
    }

    #[test]
    fn test_join_command_falls_back_to_exe() {
        let exe = std::path::Path::new("/usr/bin/ollama");
        assert_eq!(join_command(&[], Some(exe)), "/usr/bin/ollama");

        let cmd = vec!["/usr/bin/ollama".into(), "serve".into()];
        assert_eq!(join_command(&cmd, Some(exe)), "/usr/bin/ollama serve");
    }

    #[test]
    fn test_current_process_is_alive() {
        let table = SystemProcessTable::new();
        assert!(table.is_alive(std::process::id()));
        assert!(table.command_line(std::process::id()).is_some());
    }
}

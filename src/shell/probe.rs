use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;

/// Point-in-time resource snapshot of a live process and its descendants.
/// Every field is best-effort: `None` means the value could not be obtained.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Probe {
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub threads: Option<u32>,
    pub open_files: Option<usize>,
    pub connections: Option<usize>,
    pub children: Option<usize>,
    /// Listening TCP ports across the process tree, deduped, ascending.
    pub ports: Option<Vec<u16>>,
    pub user: Option<String>,
    pub env_count: Option<usize>,
}

pub trait ProbeSource: Send + Sync {
    /// Probe a PID. Unknown or dead PIDs yield an empty `Probe`.
    fn probe(&self, pid: u32) -> Probe;
}

/// `/proc`-backed probe.
pub struct ProcfsProbe;

impl ProbeSource for ProcfsProbe {
    fn probe(&self, pid: u32) -> Probe {
        if !Path::new(&format!("/proc/{pid}")).exists() {
            return Probe::default();
        }
        let descendants = descendant_pids(pid);
        Probe {
            cpu_percent: cpu_percent(pid),
            memory_mb: rss_mib(pid),
            threads: thread_count(pid),
            open_files: fd_count(pid),
            connections: socket_count(pid),
            children: descendants.as_ref().map(|d| d.len()),
            ports: listening_ports(pid, descendants.as_deref().unwrap_or(&[])),
            user: user_name(pid),
            env_count: env_count(pid),
        }
    }
}

fn read_proc(pid: u32, name: &str) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/{name}")).ok()
}

/// `/proc/<pid>/stat` fields after the comm, which may itself contain spaces
/// and parens. Original stat field N lands at index N-3.
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = read_proc(pid, "stat")?;
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?;
    Some(after.split_whitespace().map(|s| s.to_string()).collect())
}

fn clock_ticks_per_second() -> Option<f64> {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 { None } else { Some(v as f64) }
}

fn read_system_uptime_seconds() -> Option<f64> {
    let s = std::fs::read_to_string("/proc/uptime").ok()?;
    s.split_whitespace().next()?.parse().ok()
}

/// Average CPU utilization over the process lifetime, in percent.
fn cpu_percent(pid: u32) -> Option<f64> {
    let hz = clock_ticks_per_second()?;
    let sys_uptime_s = read_system_uptime_seconds()?;
    let fields = stat_fields(pid)?;
    let utime: u64 = fields.get(11)?.parse().ok()?; // field 14
    let stime: u64 = fields.get(12)?.parse().ok()?; // field 15
    let start_ticks: u64 = fields.get(19)?.parse().ok()?; // field 22
    let busy_s = (utime + stime) as f64 / hz;
    let elapsed_s = sys_uptime_s - start_ticks as f64 / hz;
    if elapsed_s <= 0.0 {
        return Some(0.0);
    }
    Some((busy_s / elapsed_s * 100.0).max(0.0))
}

fn rss_mib(pid: u32) -> Option<f64> {
    let status = read_proc(pid, "status")?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024.0)
}

fn thread_count(pid: u32) -> Option<u32> {
    stat_fields(pid)?.get(17)?.parse().ok() // field 20 (num_threads)
}

fn fd_count(pid: u32) -> Option<usize> {
    let entries = std::fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
    Some(entries.filter_map(|e| e.ok()).count())
}

fn socket_inodes(pid: u32) -> Option<BTreeSet<u64>> {
    let entries = std::fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
    let mut inodes = BTreeSet::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let target = target.to_string_lossy().into_owned();
        if let Some(rest) = target.strip_prefix("socket:[") {
            if let Some(num) = rest.strip_suffix(']') {
                if let Ok(inode) = num.parse::<u64>() {
                    inodes.insert(inode);
                }
            }
        }
    }
    Some(inodes)
}

fn socket_count(pid: u32) -> Option<usize> {
    socket_inodes(pid).map(|s| s.len())
}

/// Walk `/proc/<pid>/task/<tid>/children` transitively. Processes that
/// vanish mid-walk are skipped; only an unreadable root counts as failure.
fn descendant_pids(pid: u32) -> Option<Vec<u32>> {
    std::fs::metadata(format!("/proc/{pid}/task")).ok()?;
    let mut out: Vec<u32> = Vec::new();
    let mut queue = vec![pid];
    while let Some(p) = queue.pop() {
        for child in direct_children(p) {
            out.push(child);
            queue.push(child);
        }
    }
    Some(out)
}

fn direct_children(pid: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
        return out;
    };
    for task in tasks.filter_map(|e| e.ok()) {
        let Ok(list) = std::fs::read_to_string(task.path().join("children")) else {
            continue;
        };
        out.extend(list.split_whitespace().filter_map(|s| s.parse::<u32>().ok()));
    }
    out
}

/// Match the tree's socket inodes against LISTEN rows in /proc/net/tcp{,6}.
fn listening_ports(pid: u32, descendants: &[u32]) -> Option<Vec<u16>> {
    let mut inodes = socket_inodes(pid)?;
    for d in descendants {
        if let Some(more) = socket_inodes(*d) {
            inodes.extend(more);
        }
    }
    let mut ports: BTreeSet<u16> = BTreeSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(body) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in body.lines().skip(1) {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let (Some(local), Some(st), Some(inode)) = (cols.get(1), cols.get(3), cols.get(9))
            else {
                continue;
            };
            if *st != "0A" {
                continue; // 0A = TCP_LISTEN
            }
            let Ok(inode) = inode.parse::<u64>() else {
                continue;
            };
            if !inodes.contains(&inode) {
                continue;
            }
            let Some(port_hex) = local.rsplit(':').next() else {
                continue;
            };
            if let Ok(port) = u16::from_str_radix(port_hex, 16) {
                ports.insert(port);
            }
        }
    }
    Some(ports.into_iter().collect())
}

fn user_name(pid: u32) -> Option<String> {
    let status = read_proc(pid, "status")?;
    let line = status.lines().find(|l| l.starts_with("Uid:"))?;
    let uid: u32 = line.split_whitespace().nth(1)?.parse().ok()?;
    users::get_user_by_uid(uid).map(|u| u.name().to_string_lossy().into_owned())
}

fn env_count(pid: u32) -> Option<usize> {
    let raw = std::fs::read(format!("/proc/{pid}/environ")).ok()?;
    Some(raw.split(|b| *b == 0).filter(|s| !s.is_empty()).count())
}

//! Spawning services and reclaiming their ports
//!
//! Every service runs in its own process group with output appended to a log
//! file. Reclaiming a port finds the process listening on it and terminates
//! its whole process tree, so dev servers that fork workers go away too.

use crate::error::LaunchError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Role of a spawned process; decides which variables it must carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Backend,
    Frontend,
    Proxy,
}

/// Everything needed to start one process
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    /// Unique label, also the log file name (e.g. `chess-backend`)
    pub label: String,
    /// Name of the configured service this process belongs to
    pub service: String,
    pub role: ProcessRole,
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    /// Check the environment contract before spawning.
    ///
    /// `PORT` is mandatory for everything but the proxy, `TRUE_URL` for
    /// backends, and every name in `required` must be set and non-empty.
    pub fn validate(&self, required: &[String]) -> Result<(), LaunchError> {
        let mut needed: Vec<&str> = Vec::new();
        if self.role != ProcessRole::Proxy {
            needed.push("PORT");
        }
        if self.role == ProcessRole::Backend {
            needed.push("TRUE_URL");
        }
        needed.extend(required.iter().map(String::as_str));

        for variable in needed {
            let present = self
                .environment
                .get(variable)
                .map(|v| !v.is_empty())
                .unwrap_or(false);
            if !present {
                return Err(LaunchError::EnvironmentContract {
                    service: self.label.clone(),
                    variable: variable.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn port(&self) -> Option<u16> {
        self.environment.get("PORT").and_then(|p| p.parse().ok())
    }
}

/// A process started by [`spawn`]
#[derive(Debug)]
pub struct SpawnedProcess {
    pub label: String,
    pub pid: u32,
    pub log_path: PathBuf,
    child: Child,
}

impl SpawnedProcess {
    /// Exit status if the process already ended
    pub fn try_exit(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {}", e)),
        }
    }

    /// Reap the process after it was terminated
    pub async fn reap(&mut self, timeout: Duration) {
        if let Err(_) | Ok(Err(_)) = tokio::time::timeout(timeout, self.child.wait()).await {
            debug!(label = %self.label, pid = self.pid, "Process not reaped");
        }
    }
}

/// Start a descriptor's process in its own process group.
///
/// Stdout and stderr are appended to `<log_dir>/<label>.log`; stdin is null.
pub fn spawn(descriptor: &ServiceDescriptor, log_dir: &Path) -> Result<SpawnedProcess, LaunchError> {
    fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(format!("{}.log", descriptor.label));
    let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(&descriptor.command);
    cmd.args(&descriptor.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(log));
    cmd.stderr(Stdio::from(log_err));
    cmd.envs(&descriptor.environment);

    if let Some(ref dir) = descriptor.working_directory {
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            LaunchError::Configuration(format!(
                "{}: command '{}' not found",
                descriptor.label, descriptor.command
            ))
        } else {
            LaunchError::Io(e)
        }
    })?;
    let pid = child.id().unwrap_or(0);

    info!(
        label = %descriptor.label,
        pid,
        port = ?descriptor.port(),
        command = %descriptor.command,
        log = %log_path.display(),
        "Process spawned"
    );

    Ok(SpawnedProcess {
        label: descriptor.label.clone(),
        pid,
        log_path,
        child,
    })
}

/// Result of terminating one process tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Termination {
    /// Every pid that was signalled
    pub signalled: Vec<u32>,
    /// Pids that outlived the grace period and were force-killed
    pub killed: Vec<u32>,
}

/// Platform capability to stop a process together with all its descendants
pub trait ProcessGroup: Send + Sync {
    /// Ask the tree rooted at `pid` to stop, force it after `grace`.
    ///
    /// Blocking; run it off the async runtime.
    fn terminate(&self, pid: u32, grace: Duration) -> io::Result<Termination>;
}

/// The adapter for the current platform
pub fn platform_process_group() -> Arc<dyn ProcessGroup> {
    #[cfg(unix)]
    {
        Arc::new(UnixProcessGroup)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsProcessGroup)
    }
}

/// POSIX: signal the process group and every descendant, SIGTERM then SIGKILL
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcessGroup;

#[cfg(unix)]
impl UnixProcessGroup {
    fn signal(pid: u32, signal: libc::c_int) {
        // SAFETY: kill/getpgid have no memory-safety preconditions
        unsafe {
            if libc::getpgid(pid as libc::pid_t) == pid as libc::pid_t {
                libc::killpg(pid as libc::pid_t, signal);
            }
            libc::kill(pid as libc::pid_t, signal);
        }
    }
}

#[cfg(unix)]
impl ProcessGroup for UnixProcessGroup {
    fn terminate(&self, pid: u32, grace: Duration) -> io::Result<Termination> {
        if pid == std::process::id() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to terminate self"));
        }

        // Children first in the list so none is orphaned before it is seen
        let mut tree = descendants(pid);
        tree.push(pid);
        tree.retain(|p| *p != std::process::id());

        for p in &tree {
            Self::signal(*p, libc::SIGTERM);
        }
        debug!(pid, tree = ?tree, "Sent SIGTERM to process tree");

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && tree.iter().any(|p| is_alive(*p)) {
            std::thread::sleep(Duration::from_millis(100));
        }

        let killed: Vec<u32> = tree.iter().copied().filter(|p| is_alive(*p)).collect();
        for p in &killed {
            Self::signal(*p, libc::SIGKILL);
        }
        if !killed.is_empty() {
            warn!(pid, killed = ?killed, grace_secs = grace.as_secs(), "Grace period exceeded, sent SIGKILL");
        }

        Ok(Termination { signalled: tree, killed })
    }
}

/// Kill the process group led by `pid` without waiting
#[cfg(unix)]
pub fn kill_group(pid: u32) {
    UnixProcessGroup::signal(pid, libc::SIGKILL);
}

/// Windows: `taskkill /T` stops the tree, `/F` forces it
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsProcessGroup;

#[cfg(windows)]
impl ProcessGroup for WindowsProcessGroup {
    fn terminate(&self, pid: u32, grace: Duration) -> io::Result<Termination> {
        let pid_arg = pid.to_string();
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/PID", &pid_arg])
            .output()?;

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && is_alive(pid) {
            std::thread::sleep(Duration::from_millis(100));
        }

        let mut killed = Vec::new();
        if is_alive(pid) {
            let output = std::process::Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid_arg])
                .output()?;
            if !output.status.success() {
                return Err(io::Error::other(String::from_utf8_lossy(&output.stderr).into_owned()));
            }
            killed.push(pid);
        }

        Ok(Termination { signalled: vec![pid], killed })
    }
}

/// Whether `pid` still exists (zombies count as gone)
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // State follows the parenthesised command name
        return match stat.rsplit_once(')') {
            Some((_, rest)) => !rest.trim_start().starts_with('Z'),
            None => true,
        };
    }
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// All descendants of `pid`, deepest first
#[cfg(unix)]
pub fn descendants(pid: u32) -> Vec<u32> {
    let mut seen = BTreeSet::new();
    let mut order = Vec::new();
    let mut stack = vec![pid];

    while let Some(parent) = stack.pop() {
        for child in children_of(parent) {
            if seen.insert(child) {
                order.push(child);
                stack.push(child);
            }
        }
    }

    order.reverse();
    order
}

#[cfg(unix)]
fn children_of(pid: u32) -> Vec<u32> {
    let task_dir = PathBuf::from(format!("/proc/{}/task", pid));
    if let Ok(tasks) = fs::read_dir(&task_dir) {
        let mut children = Vec::new();
        for task in tasks.flatten() {
            if let Ok(list) = fs::read_to_string(task.path().join("children")) {
                children.extend(list.split_whitespace().filter_map(|p| p.parse::<u32>().ok()));
            }
        }
        return children;
    }

    // No procfs: ask pgrep
    match std::process::Command::new("pgrep").arg("-P").arg(pid.to_string()).output() {
        Ok(output) => parse_pid_list(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            debug!(pid, error = %e, "pgrep unavailable");
            Vec::new()
        }
    }
}

fn parse_pid_list(output: &str) -> Vec<u32> {
    output
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .collect()
}

/// Which processes listen on which ports
#[derive(Debug, Clone, Default)]
pub struct PortOwners {
    owners: HashMap<u16, BTreeSet<u32>>,
}

impl PortOwners {
    /// Look up the listeners of `ports`; the current process is never included
    pub fn lookup(ports: &BTreeSet<u16>) -> Self {
        #[cfg(target_os = "linux")]
        {
            match procfs_owners(ports) {
                Ok(owners) => return Self::without_self(owners),
                Err(e) => debug!(error = %e, "procfs lookup failed, falling back to lsof"),
            }
        }
        Self::without_self(lsof_owners(ports))
    }

    fn without_self(mut owners: HashMap<u16, BTreeSet<u32>>) -> Self {
        let me = std::process::id();
        for pids in owners.values_mut() {
            pids.remove(&me);
        }
        owners.retain(|_, pids| !pids.is_empty());
        Self { owners }
    }

    pub fn owners(&self, port: u16) -> impl Iterator<Item = u32> + '_ {
        self.owners.get(&port).into_iter().flatten().copied()
    }

    /// Every distinct owning pid with the ports it holds
    pub fn by_pid(&self) -> BTreeMap<u32, Vec<u16>> {
        let mut out: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
        for (port, pids) in &self.owners {
            for pid in pids {
                out.entry(*pid).or_default().push(*port);
            }
        }
        for ports in out.values_mut() {
            ports.sort_unstable();
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Parse `/proc/net/tcp{,6}` content into listening socket inode -> port
fn parse_listening_inodes(content: &str, ports: &BTreeSet<u16>) -> HashMap<u64, u16> {
    let mut inodes = HashMap::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        // 0A = LISTEN
        if parts[3] != "0A" {
            continue;
        }

        let Some(port) = parts[1]
            .rsplit_once(':')
            .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok())
        else {
            continue;
        };
        if !ports.contains(&port) {
            continue;
        }

        if let Ok(inode) = parts[9].parse::<u64>() {
            if inode != 0 {
                inodes.insert(inode, port);
            }
        }
    }

    inodes
}

#[cfg(target_os = "linux")]
fn procfs_owners(ports: &BTreeSet<u16>) -> io::Result<HashMap<u16, BTreeSet<u32>>> {
    let mut inodes = HashMap::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match fs::read_to_string(table) {
            Ok(content) => inodes.extend(parse_listening_inodes(&content, ports)),
            // IPv6 may be disabled
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    let mut owners: HashMap<u16, BTreeSet<u32>> = HashMap::new();
    if inodes.is_empty() {
        return Ok(owners);
    }

    for entry in fs::read_dir("/proc")?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Processes of other users are unreadable; skip them
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            let inode = target
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(port) = inode.and_then(|i| inodes.get(&i)) {
                owners.entry(*port).or_default().insert(pid);
            }
        }
    }

    Ok(owners)
}

fn lsof_owners(ports: &BTreeSet<u16>) -> HashMap<u16, BTreeSet<u32>> {
    let mut owners = HashMap::new();
    for port in ports {
        let output = std::process::Command::new("lsof")
            .args(["-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
            .output();
        match output {
            Ok(output) => {
                let pids: BTreeSet<u32> =
                    parse_pid_list(&String::from_utf8_lossy(&output.stdout)).into_iter().collect();
                if !pids.is_empty() {
                    owners.insert(*port, pids);
                }
            }
            Err(e) => {
                warn!(error = %e, "lsof unavailable, cannot look up port owners");
                break;
            }
        }
    }
    owners
}

/// Outcome of a reclaim pass
#[derive(Debug, Clone, Default)]
pub struct ReclaimReport {
    /// Pid and the ports it held, for every tree that was terminated
    pub terminated: Vec<(u32, Vec<u16>)>,
    /// Pids that could not be terminated
    pub failed: Vec<(u32, String)>,
}

/// Terminate every process tree listening on one of `ports`.
///
/// Free ports are not an error. A failure to stop one tree is logged and
/// does not stop the others from being reclaimed.
pub async fn reclaim_ports(
    ports: BTreeSet<u16>,
    group: Arc<dyn ProcessGroup>,
    grace: Duration,
) -> ReclaimReport {
    let owners = match tokio::task::spawn_blocking(move || PortOwners::lookup(&ports)).await {
        Ok(owners) => owners,
        Err(e) => {
            warn!(error = %e, "Port owner lookup panicked");
            return ReclaimReport::default();
        }
    };

    if owners.is_empty() {
        debug!("No stale listeners to reclaim");
        return ReclaimReport::default();
    }

    let tasks = owners.by_pid().into_iter().map(|(pid, held)| {
        let group = Arc::clone(&group);
        async move {
            info!(pid, ports = ?held, "Reclaiming ports");
            let result = tokio::task::spawn_blocking(move || group.terminate(pid, grace)).await;
            (pid, held, result)
        }
    });

    let mut report = ReclaimReport::default();
    for (pid, held, result) in futures::future::join_all(tasks).await {
        match result {
            Ok(Ok(_)) => report.terminated.push((pid, held)),
            Ok(Err(e)) => {
                warn!(pid, ports = ?held, error = %e, "Failed to terminate process tree");
                report.failed.push((pid, e.to_string()));
            }
            Err(e) => {
                warn!(pid, error = %e, "Termination task panicked");
                report.failed.push((pid, e.to_string()));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(role: ProcessRole, env: &[(&str, &str)]) -> ServiceDescriptor {
        ServiceDescriptor {
            label: "chess-backend".to_string(),
            service: "chess".to_string(),
            role,
            command: "node".to_string(),
            args: vec!["server.js".to_string()],
            working_directory: None,
            environment: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_backend_requires_port_and_true_url() {
        let d = descriptor(ProcessRole::Backend, &[("PORT", "10001")]);
        match d.validate(&[]) {
            Err(LaunchError::EnvironmentContract { variable, .. }) => assert_eq!(variable, "TRUE_URL"),
            other => panic!("expected contract violation, got {:?}", other),
        }

        let d = descriptor(
            ProcessRole::Backend,
            &[("PORT", "10001"), ("TRUE_URL", "http://localhost:9999/localhost_10001")],
        );
        assert!(d.validate(&[]).is_ok());
        assert_eq!(d.port(), Some(10001));
    }

    #[test]
    fn test_frontend_does_not_need_true_url() {
        let d = descriptor(ProcessRole::Frontend, &[("PORT", "11001")]);
        assert!(d.validate(&[]).is_ok());

        let d = descriptor(ProcessRole::Frontend, &[]);
        assert!(d.validate(&[]).is_err());
    }

    #[test]
    fn test_proxy_needs_no_port() {
        let d = descriptor(ProcessRole::Proxy, &[]);
        assert!(d.validate(&[]).is_ok());
    }

    #[test]
    fn test_required_env_must_be_non_empty() {
        let d = descriptor(ProcessRole::Frontend, &[("PORT", "11001"), ("FIREBASE_KEY", "")]);
        let err = d.validate(&["FIREBASE_KEY".to_string()]).unwrap_err();
        assert!(err.to_string().contains("FIREBASE_KEY"));
    }

    #[test]
    fn test_parse_listening_inodes() {
        let content = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:2711 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 11111 1 0000000000000000 100 0 0 10 0
   1: 0100007F:2712 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 22222 1 0000000000000000 100 0 0 10 0
   2: 0100007F:2711 0100007F:D431 01 00000000:00000000 00:00000000 00000000  1000        0 33333 1 0000000000000000 100 0 0 10 0
";
        let ports: BTreeSet<u16> = [10001].into_iter().collect();
        let inodes = parse_listening_inodes(content, &ports);

        // 0x2711 = 10001; 0x2712 is not requested; the ESTABLISHED row is skipped
        assert_eq!(inodes.len(), 1);
        assert_eq!(inodes.get(&11111), Some(&10001));
    }

    #[test]
    fn test_parse_listening_inodes_ipv6() {
        let content = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000001000000:2710 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 44444 1 0000000000000000 100 0 0 10 0
";
        let ports: BTreeSet<u16> = [10000].into_iter().collect();
        assert_eq!(parse_listening_inodes(content, &ports).get(&44444), Some(&10000));
    }

    #[test]
    fn test_parse_pid_list() {
        assert_eq!(parse_pid_list("123\n456\n\nabc\n"), vec![123, 456]);
    }

    #[test]
    fn test_owners_exclude_self() {
        let mut raw = HashMap::new();
        raw.insert(10001, [std::process::id()].into_iter().collect::<BTreeSet<_>>());
        raw.insert(10002, [std::process::id(), 4242].into_iter().collect::<BTreeSet<_>>());

        let owners = PortOwners::without_self(raw);
        assert_eq!(owners.owners(10001).count(), 0);
        assert_eq!(owners.owners(10002).collect::<Vec<_>>(), vec![4242]);
        assert_eq!(owners.by_pid().get(&4242), Some(&vec![10002]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_writes_log_and_terminate_tree() {
        let dir = tempfile::tempdir().unwrap();
        let d = ServiceDescriptor {
            label: "sleeper".to_string(),
            service: "sleeper".to_string(),
            role: ProcessRole::Frontend,
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo started; sleep 30 & sleep 30; wait".to_string(),
            ],
            working_directory: Some(dir.path().to_path_buf()),
            environment: [("PORT".to_string(), "11001".to_string())].into_iter().collect(),
        };

        let mut spawned = spawn(&d, &dir.path().join("logs")).unwrap();
        let pid = spawned.pid;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let children = descendants(pid);
        assert!(!children.is_empty());

        let group = UnixProcessGroup;
        let termination = tokio::task::spawn_blocking(move || group.terminate(pid, Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert!(termination.signalled.contains(&pid));

        spawned.reap(Duration::from_secs(2)).await;
        assert!(!is_alive(pid));
        for child in children {
            assert!(!is_alive(child));
        }

        let log = fs::read_to_string(&spawned.log_path).unwrap();
        assert!(log.contains("started"));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_refuses_self() {
        let err = UnixProcessGroup
            .terminate(std::process::id(), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_missing_command_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = descriptor(ProcessRole::Frontend, &[("PORT", "11001")]);
        d.command = "definitely-not-a-real-binary-portgate".to_string();

        let err = spawn(&d, dir.path()).unwrap_err();
        assert!(matches!(err, LaunchError::Configuration(_)));
    }
}

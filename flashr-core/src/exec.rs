//! External command execution.
//!
//! Everything that spawns a process goes through the traits in this module so
//! the enumerator and the flash pipeline can be exercised without real disks
//! or elevated privileges.
use anyhow::{Context, Result, anyhow, bail};
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// The result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout and stderr joined, trimmed, for error messages.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Runs a program to completion and captures its output.
pub trait CommandExecutor: Send + Sync {
    fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// A spawned process that can be polled and killed.
pub trait RunningProcess: Send {
    /// Returns the output once the process has exited, without blocking.
    fn try_wait(&mut self) -> Result<Option<CommandOutput>>;

    /// Requests termination and reaps the process.
    fn kill(&mut self) -> Result<CommandOutput>;
}

/// Runs a shell pipeline with elevated rights. Implementations must ask for
/// privileges once for the whole script.
pub trait PrivilegedExecutor: Send + Sync {
    fn spawn_script(&self, script: &str) -> Result<Box<dyn RunningProcess>>;
}

/// Executes commands with [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        log::debug!("exec: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run {program}"))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// How the privileged pipeline gains root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrivilegeHelper {
    /// Already running as root; run `sh -c` directly.
    None,
    /// Prefix the shell with a helper program such as `pkexec` or `sudo`.
    Program(String),
}

impl PrivilegeHelper {
    /// Picks no helper when running as root, otherwise `fallback`.
    pub fn detect(fallback: &str) -> Self {
        #[cfg(unix)]
        {
            if nix::unistd::geteuid().is_root() {
                return PrivilegeHelper::None;
            }
        }
        PrivilegeHelper::Program(fallback.to_string())
    }
}

/// Spawns `sh -c <script>` behind a [`PrivilegeHelper`].
#[derive(Clone, Debug)]
pub struct ShellPrivileged {
    helper: PrivilegeHelper,
}

impl ShellPrivileged {
    pub fn new(helper: PrivilegeHelper) -> Self {
        Self { helper }
    }

    fn command(&self, script: &str) -> Command {
        match &self.helper {
            PrivilegeHelper::None => {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", script]);
                cmd
            }
            PrivilegeHelper::Program(helper) => {
                let mut cmd = Command::new(helper);
                cmd.args(["sh", "-c", script]);
                cmd
            }
        }
    }
}

impl PrivilegedExecutor for ShellPrivileged {
    fn spawn_script(&self, script: &str) -> Result<Box<dyn RunningProcess>> {
        log::debug!("privileged ({:?}): {}", self.helper, script);
        let mut child = self
            .command(script)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn privileged shell")?;

        // Drain both pipes on their own threads so a chatty child cannot block.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        Ok(Box::new(ChildProcess {
            child,
            helper: self.helper.clone(),
            stdout,
            stderr,
        }))
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// How long a signalled pipeline gets to exit before escalating.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// How long a killed pipeline's output pipes get to close.
const DRAIN_GRACE: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ChildProcess {
    child: Child,
    helper: PrivilegeHelper,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl ChildProcess {
    /// Gathers the drained output. Unless `block` is set, pipes still held
    /// open by stray descendants are abandoned after a short grace period.
    fn collect(&mut self, code: Option<i32>, block: bool) -> CommandOutput {
        if !block {
            let settled = |h: &Option<JoinHandle<Vec<u8>>>| h.as_ref().is_none_or(|h| h.is_finished());
            let deadline = Instant::now() + DRAIN_GRACE;
            while !(settled(&self.stdout) && settled(&self.stderr)) && Instant::now() < deadline {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        let join = |h: Option<JoinHandle<Vec<u8>>>| {
            h.filter(|h| block || h.is_finished())
                .and_then(|h| h.join().ok())
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default()
        };
        CommandOutput {
            code,
            stdout: join(self.stdout.take()),
            stderr: join(self.stderr.take()),
        }
    }

    fn wait_for_exit(&mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Signals the whole process tree: SIGTERM first, SIGKILL if that is
    /// ignored. Privilege helpers may fork, so the direct child alone is not
    /// enough.
    #[cfg(unix)]
    fn terminate_tree(&mut self) -> Result<ExitStatus> {
        use nix::sys::signal::Signal;

        let tree = process_tree(self.child.id());
        log::debug!("terminating process tree {tree:?}");

        signal_tree(&self.helper, &tree, Signal::SIGTERM)?;
        if let Some(status) = self.wait_for_exit(KILL_GRACE)? {
            return Ok(status);
        }

        log::warn!("write pipeline ignored SIGTERM, sending SIGKILL");
        signal_tree(&self.helper, &tree, Signal::SIGKILL)?;
        self.wait_for_exit(KILL_GRACE)?
            .ok_or_else(|| anyhow!("Process {} did not exit after SIGKILL", self.child.id()))
    }

    #[cfg(not(unix))]
    fn terminate_tree(&mut self) -> Result<ExitStatus> {
        self.child.kill().context("Failed to kill write pipeline")?;
        Ok(self.child.wait()?)
    }
}

impl RunningProcess for ChildProcess {
    fn try_wait(&mut self) -> Result<Option<CommandOutput>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(self.collect(status.code(), true))),
            None => Ok(None),
        }
    }

    fn kill(&mut self) -> Result<CommandOutput> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(self.collect(status.code(), true));
        }
        let status = self.terminate_tree()?;
        Ok(self.collect(status.code(), false))
    }
}

/// `root` followed by every process descending from it, parents first.
#[cfg(unix)]
fn process_tree(root: u32) -> Vec<u32> {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());

    let mut tree = vec![root];
    let mut next = 0;
    while next < tree.len() {
        let parent = Pid::from_u32(tree[next]);
        let children: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(pid, process)| process.parent() == Some(parent) && !tree.contains(&pid.as_u32()))
            .map(|(pid, _)| pid.as_u32())
            .collect();
        tree.extend(children);
        next += 1;
    }
    tree
}

/// Sends `signal` to every pid. Processes owned by root are signalled
/// through the privilege helper.
#[cfg(unix)]
fn signal_tree(helper: &PrivilegeHelper, pids: &[u32], signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let mut denied = Vec::new();
    for &pid in pids {
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => denied.push(pid),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to send {} to {pid}", signal.as_str()));
            }
        }
    }
    if denied.is_empty() {
        return Ok(());
    }

    let PrivilegeHelper::Program(helper) = helper else {
        bail!("Not permitted to send {} to {denied:?}", signal.as_str());
    };
    log::info!("Sending {} to {denied:?} through {helper}", signal.as_str());
    let name = signal.as_str().trim_start_matches("SIG");
    let out = Command::new(helper)
        .args(["kill", "-s", name, "--"])
        .args(denied.iter().map(u32::to_string))
        .stdin(Stdio::inherit())
        .output()
        .with_context(|| format!("Failed to run {helper} kill"))?;
    // Some targets may already be gone; the caller waits for the exit either way.
    if !out.status.success() {
        log::warn!(
            "{helper} kill exited with {:?}: {}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

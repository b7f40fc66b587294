use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TopologyError;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Program and arguments for a child rescan process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// A short-lived child process that can be waited on with a deadline and
/// terminated best-effort.
#[derive(Debug)]
pub struct RescanProcess {
    child: Child,
    label: String,
    started: Instant,
}

impl RescanProcess {
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, TopologyError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| {
                TopologyError::Rescan(format!("failed to spawn {}: {err}", spec.describe()))
            })?;
        debug!("spawned rescan process {} (pid {})", spec.describe(), child.id());
        Ok(Self {
            child,
            label: spec.describe(),
            started: Instant::now(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Non-blocking check; `None` while the child is still running.
    pub fn try_finished(&mut self) -> Result<Option<ExitStatus>, TopologyError> {
        self.child
            .try_wait()
            .map_err(|err| TopologyError::Rescan(format!("failed to poll {}: {err}", self.label)))
    }

    /// Waits up to `timeout`; `None` means the child outlived the deadline.
    pub fn wait_with_deadline(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>, TopologyError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_finished()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Asks the child to stop, then kills it. Never fails: anything that
    /// goes wrong is logged. The whole operation is bounded by `timeout`.
    pub fn terminate(mut self, timeout: Duration) {
        match self.try_finished() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => warn!("{}", err),
        }

        let grace = timeout / 2;
        if request_stop(&self.child) {
            if let Ok(Some(_)) = self.wait_with_deadline(grace) {
                debug!("rescan process {} stopped on request", self.label);
                return;
            }
        }

        if let Err(err) = self.child.kill() {
            warn!("failed to kill rescan process {}: {}", self.label, err);
        }
        match self.wait_with_deadline(timeout.saturating_sub(grace)) {
            Ok(Some(_)) => debug!("rescan process {} killed", self.label),
            Ok(None) => warn!(
                "rescan process {} still running after termination attempt",
                self.label
            ),
            Err(err) => warn!("{}", err),
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            debug!("SIGTERM to pid {} failed: {}", pid, err);
            false
        }
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) -> bool {
    false
}

/// Runs `spec` to completion or until `timeout`, terminating it on deadline.
pub fn run_with_deadline(
    spec: &ProcessSpec,
    timeout: Duration,
    terminate_timeout: Duration,
) -> Result<(), TopologyError> {
    let mut process = RescanProcess::spawn(spec)?;
    match process.wait_with_deadline(timeout)? {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(TopologyError::Rescan(format!(
            "{} exited with {}",
            process.label(),
            status
        ))),
        None => {
            let label = process.label().to_string();
            process.terminate(terminate_timeout);
            Err(TopologyError::Rescan(format!(
                "{} did not finish within {:?}",
                label, timeout
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use super::{run_with_deadline, ProcessSpec, RescanProcess};

    #[test]
    fn waits_for_quick_process() {
        let mut process = RescanProcess::spawn(&ProcessSpec::new("true", Vec::<String>::new()))
            .expect("spawn true");
        let status = process
            .wait_with_deadline(Duration::from_secs(5))
            .expect("wait")
            .expect("finished");
        assert!(status.success());
    }

    #[test]
    fn deadline_expires_and_terminate_is_bounded() {
        let mut process =
            RescanProcess::spawn(&ProcessSpec::new("sleep", ["30"])).expect("spawn sleep");
        let waited = process
            .wait_with_deadline(Duration::from_millis(50))
            .expect("wait");
        assert!(waited.is_none());

        let started = Instant::now();
        process.terminate(Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn run_with_deadline_reports_failures() {
        assert!(run_with_deadline(
            &ProcessSpec::new("true", Vec::<String>::new()),
            Duration::from_secs(5),
            Duration::from_secs(1)
        )
        .is_ok());
        assert!(run_with_deadline(
            &ProcessSpec::new("false", Vec::<String>::new()),
            Duration::from_secs(5),
            Duration::from_secs(1)
        )
        .is_err());
        assert!(run_with_deadline(
            &ProcessSpec::new("sleep", ["30"]),
            Duration::from_millis(50),
            Duration::from_secs(1)
        )
        .is_err());
        assert!(run_with_deadline(
            &ProcessSpec::new("/nonexistent/rescan-tool", Vec::<String>::new()),
            Duration::from_secs(1),
            Duration::from_secs(1)
        )
        .is_err());
    }

    #[test]
    fn describes_command_line() {
        let spec = ProcessSpec::new("scsi-rescan", ["rescan-worker"]).with_arg("--retry");
        assert_eq!(spec.describe(), "scsi-rescan rescan-worker --retry");
    }
}

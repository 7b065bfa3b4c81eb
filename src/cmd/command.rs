//! Child-process execution wrapper, grounded on the teacher's `cmd::command::QoveryCommand`.
//!
//! Every long-running external command the engine spawns (`terraform`, archive downloads via
//! `reqwest`) funnels through here so cancellation, timeouts and line-by-line log forwarding are
//! handled once. stdout and stderr are drained as two independent read loops, each with its own
//! `TimeoutReader`, so neither stream can starve the other.

use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Error, ErrorKind};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use timeout_readwrite::TimeoutReader;

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("error while executing command")]
    ExecutionError(#[from] Error),

    #[error("command terminated with a non success exit status code: {0}")]
    ExitStatusError(ExitStatus),

    #[error("command killed due to timeout: {0}")]
    TimeoutError(String),

    #[error("command killed by cancellation: {0}")]
    Cancelled(String),
}

#[derive(Debug, Clone)]
pub enum AbortReason {
    Timeout(Duration),
    Cancelled(String),
}

impl AbortReason {
    pub fn is_cancel(&self) -> bool {
        matches!(self, AbortReason::Cancelled(_))
    }
}

pub enum ProcessKillerTrigger<'a> {
    Timeout(Instant, Duration),
    Cancelable(&'a dyn Fn() -> bool),
}

const LOGGING_INTERVAL: Duration = Duration::from_secs(120);

impl<'a> ProcessKillerTrigger<'a> {
    pub fn should_abort(&self) -> Option<AbortReason> {
        match self {
            ProcessKillerTrigger::Timeout(since, timeout) => {
                if &since.elapsed() >= timeout {
                    Some(AbortReason::Timeout(*timeout))
                } else {
                    None
                }
            }
            ProcessKillerTrigger::Cancelable(func) => {
                if (func)() {
                    Some(AbortReason::Cancelled("cancellation signal received".to_string()))
                } else {
                    None
                }
            }
        }
    }
}

/// Composite cancellation/timeout signal, shared between Terraform child processes and
/// (via a `reqwest` per-request timeout) the registry download client — one cancellation
/// vocabulary across the crate.
pub enum ProcessKiller<'a> {
    None,
    One(ProcessKillerTrigger<'a>),
    Two(ProcessKillerTrigger<'a>, ProcessKillerTrigger<'a>),
}

impl<'a> ProcessKiller<'a> {
    pub fn should_abort(&self) -> Option<AbortReason> {
        match self {
            ProcessKiller::None => None,
            ProcessKiller::One(t) => t.should_abort(),
            ProcessKiller::Two(a, b) => a.should_abort().or_else(|| b.should_abort()),
        }
    }

    pub fn never() -> ProcessKiller<'a> {
        ProcessKiller::None
    }

    pub fn from_timeout(timeout: Duration) -> ProcessKiller<'a> {
        ProcessKiller::One(ProcessKillerTrigger::Timeout(Instant::now(), timeout))
    }

    pub fn from_cancelable(is_cancelled: &'a dyn Fn() -> bool) -> ProcessKiller<'a> {
        ProcessKiller::One(ProcessKillerTrigger::Cancelable(is_cancelled))
    }

    pub fn from(timeout: Duration, is_cancelled: &'a dyn Fn() -> bool) -> ProcessKiller<'a> {
        ProcessKiller::Two(
            ProcessKillerTrigger::Timeout(Instant::now(), timeout),
            ProcessKillerTrigger::Cancelable(is_cancelled),
        )
    }
}

pub struct ChildProcess {
    command: Command,
    kill_grace_period: Duration,
}

impl ChildProcess {
    pub fn new<P: AsRef<Path>>(binary: P, args: &[&str], envs: &[(&str, &str)]) -> ChildProcess {
        let mut command = Command::new(binary.as_ref().as_os_str());
        command.args(args);
        envs.iter().for_each(|(k, v)| {
            command.env(k, v);
        });

        ChildProcess { command, kill_grace_period: Duration::from_secs(60 * 5) }
    }

    pub fn set_current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.command.current_dir(dir);
        self
    }

    pub fn set_kill_grace_period(&mut self, grace_period: Duration) -> &mut Self {
        self.kill_grace_period = grace_period;
        self
    }

    fn kill(&self, cmd_handle: &mut Child) {
        warn!("killing command: {:?}", cmd_handle);

        #[cfg(unix)]
        unsafe {
            let pid = cmd_handle.id() as i32;
            let _ = libc::kill(pid, libc::SIGINT);
        }

        let killed_since = Instant::now();
        while let Ok(None) = cmd_handle.try_wait() {
            if killed_since.elapsed() > self.kill_grace_period {
                warn!("command still running after grace period, hard killing it");
                let _ = cmd_handle.kill();
            }
            std::thread::sleep(Duration::from_millis(500));
        }

        let _ = cmd_handle.wait();
    }

    pub fn exec(&mut self) -> Result<(), CommandError> {
        self.exec_with_abort(&mut |line| info!("{line}"), &mut |line| warn!("{line}"), &ProcessKiller::never())
    }

    pub fn exec_with_output<STDOUT, STDERR>(
        &mut self,
        stdout_output: &mut STDOUT,
        stderr_output: &mut STDERR,
    ) -> Result<(), CommandError>
    where
        STDOUT: FnMut(String),
        STDERR: FnMut(String),
    {
        self.exec_with_abort(stdout_output, stderr_output, &ProcessKiller::never())
    }

    pub fn exec_with_abort<STDOUT, STDERR>(
        &mut self,
        stdout_output: &mut STDOUT,
        stderr_output: &mut STDERR,
        abort_notifier: &ProcessKiller,
    ) -> Result<(), CommandError>
    where
        STDOUT: FnMut(String),
        STDERR: FnMut(String),
    {
        debug!("command: {:?}", self.command);
        let mut cmd_handle =
            self.command.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn().map_err(CommandError::ExecutionError)?;

        let reader_timeout = Duration::from_secs(1);
        let stdout = cmd_handle
            .stdout
            .take()
            .ok_or_else(|| CommandError::ExecutionError(Error::new(ErrorKind::BrokenPipe, "cannot get stdout")))?;
        let mut stdout_reader = BufReader::new(TimeoutReader::new(stdout, reader_timeout)).lines();

        let stderr = cmd_handle
            .stderr
            .take()
            .ok_or_else(|| CommandError::ExecutionError(Error::new(ErrorKind::BrokenPipe, "cannot get stderr")))?;
        let mut stderr_reader = BufReader::new(TimeoutReader::new(stderr, Duration::from_secs(0))).lines();

        let mut stdout_closed = false;
        let mut stderr_closed = false;
        let mut last_log = Instant::now();

        while !stdout_closed || !stderr_closed {
            if abort_notifier.should_abort().is_some() {
                break;
            }

            while !stdout_closed {
                let line = match stdout_reader.next() {
                    Some(line) => line,
                    None => {
                        stdout_closed = true;
                        break;
                    }
                };

                match line {
                    Err(ref err) if err.kind() == ErrorKind::TimedOut => {
                        if last_log.elapsed() > LOGGING_INTERVAL {
                            stderr_output("still running, no output available...".to_string());
                            last_log = Instant::now();
                        }
                        break;
                    }
                    Ok(line) => stdout_output(line),
                    Err(err) => {
                        error!("error reading stdout of {:?}: {:?}", self.command, err);
                        stdout_closed = true;
                        break;
                    }
                }

                if abort_notifier.should_abort().is_some() {
                    stdout_closed = true;
                    stderr_closed = true;
                    break;
                }
            }

            while !stderr_closed {
                let line = match stderr_reader.next() {
                    Some(line) => line,
                    None => {
                        stderr_closed = true;
                        break;
                    }
                };

                match line {
                    Err(ref err) if err.kind() == ErrorKind::TimedOut => break,
                    Ok(line) => stderr_output(line),
                    Err(err) => {
                        error!("error reading stderr of {:?}: {:?}", self.command, err);
                        stderr_closed = true;
                        break;
                    }
                }

                if abort_notifier.should_abort().is_some() {
                    stdout_closed = true;
                    stderr_closed = true;
                    break;
                }
            }
        }

        let exit_status;
        loop {
            match cmd_handle.try_wait() {
                Ok(Some(status)) => {
                    exit_status = status;
                    break;
                }
                Ok(None) => match abort_notifier.should_abort() {
                    None => {}
                    Some(reason) => {
                        let msg = format!("killing process {:?} due to {:?}", self.command, reason);
                        warn!("{msg}");
                        self.kill(&mut cmd_handle);

                        while let Some(Ok(line)) = stdout_reader.next() {
                            stdout_output(line);
                        }
                        while let Some(Ok(line)) = stderr_reader.next() {
                            stderr_output(line);
                        }

                        return if reason.is_cancel() { Err(CommandError::Cancelled(msg)) } else { Err(CommandError::TimeoutError(msg)) };
                    }
                },
                Err(err) => return Err(CommandError::ExecutionError(err)),
            };

            std::thread::sleep(Duration::from_millis(200));
        }

        if !exit_status.success() {
            return Err(CommandError::ExitStatusError(exit_status));
        }

        Ok(())
    }
}

pub fn does_binary_exist<S: AsRef<OsStr>>(binary: S) -> bool {
    Command::new(binary).stdout(Stdio::null()).stdin(Stdio::null()).stderr(Stdio::null()).spawn().map(|mut c| c.wait()).is_ok()
}

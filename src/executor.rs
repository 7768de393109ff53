use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, SaveError};
use crate::store_manager::CommandStore;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Process-wide cancellation flag, set from the Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    TimedOut(Duration),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutcome {
    pub termination: Termination,
    pub output: String, // stdout and stderr, interleaved as read
}

/// Runs a command string and reports how it ended.
pub trait ShellRunner: Send + Sync {
    fn run(&self, command: &str, deadline: Option<Deadline>, cancel: &CancelToken) -> io::Result<ShellOutcome>;
}

/// Runs commands through `<shell> -c`.
///
/// Output is read until both pipes close. A background process started by the
/// command keeps them open after the shell exits; that wait is bounded by the
/// deadline and the cancel token, and without a deadline it lasts until the
/// background process exits.
pub struct SystemShell {
    shell: String,
}

impl SystemShell {
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }

    /// Runs with the terminal attached and returns the exit code (-1 when killed by a signal).
    pub fn run_interactive(&self, command: &str, dir: Option<&Path>) -> io::Result<i32> {
        let mut process = Command::new(&self.shell);
        process
            .arg("-c")
            .arg(command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = dir {
            process.current_dir(dir);
        }
        Ok(process.status()?.code().unwrap_or(-1))
    }
}

impl Default for SystemShell {
    fn default() -> Self {
        Self::new("sh")
    }
}

fn collect_into<R: Read + Send + 'static>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0u8; 4096];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .extend_from_slice(&buffer[..n]),
            }
        }
    })
}

fn drain(sink: &Arc<Mutex<Vec<u8>>>) -> String {
    let bytes = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    String::from_utf8_lossy(&bytes).to_string()
}

impl ShellRunner for SystemShell {
    fn run(&self, command: &str, deadline: Option<Deadline>, cancel: &CancelToken) -> io::Result<ShellOutcome> {
        if cancel.is_cancelled() {
            return Ok(ShellOutcome {
                termination: Termination::Cancelled,
                output: String::new(),
            });
        }

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(collect_into(stdout, Arc::clone(&sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(collect_into(stderr, Arc::clone(&sink)));
        }

        loop {
            if let Some(status) = child.try_wait()? {
                while !readers.iter().all(|reader| reader.is_finished()) {
                    if cancel.is_cancelled() || deadline.map_or(false, |d| d.expired()) {
                        tracing::warn!(command, "output still held open by a background process, not waiting for it");
                        break;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                // unfinished readers are detached along with whatever still holds the pipes
                return Ok(ShellOutcome {
                    termination: Termination::Exited(status.code().unwrap_or(-1)),
                    output: drain(&sink),
                });
            }

            let stop = if cancel.is_cancelled() {
                Some(Termination::Cancelled)
            } else {
                deadline
                    .filter(Deadline::expired)
                    .map(|d| Termination::TimedOut(d.budget()))
            };
            if let Some(termination) = stop {
                // readers are left behind: a backgrounded grandchild may still hold the pipes
                let _ = child.kill();
                let _ = child.wait();
                tracing::debug!(command, ?termination, "child process killed");
                return Ok(ShellOutcome {
                    termination,
                    output: drain(&sink),
                });
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub command_id: u64,
    pub exit_code: i32,
    pub output: String,
}

/// Results of a primary command and its parallel peers.
#[derive(Debug)]
pub struct GroupOutcome {
    pub primary: Result<StepOutcome>,
    pub peers: Vec<(u64, Result<StepOutcome>)>,
}

/// Runs saved commands by ID and turns shell outcomes into typed results.
pub struct StepExecutor<'a> {
    shell: &'a dyn ShellRunner,
    cancel: CancelToken,
}

impl<'a> StepExecutor<'a> {
    pub fn new(shell: &'a dyn ShellRunner, cancel: CancelToken) -> Self {
        Self { shell, cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn run(&self, store: &CommandStore, command_id: u64, deadline: Option<Deadline>) -> Result<StepOutcome> {
        let raw = &store.command(command_id)?.raw;
        self.run_text(command_id, raw, deadline)
    }

    fn run_text(&self, command_id: u64, raw: &str, deadline: Option<Deadline>) -> Result<StepOutcome> {
        tracing::debug!(command_id, command = raw, "running command");
        let outcome = self
            .shell
            .run(raw, deadline, &self.cancel)
            .map_err(|e| SaveError::Execution {
                command_id,
                exit_code: None,
                message: format!("failed to start: {}", e),
                output: String::new(),
            })?;

        match outcome.termination {
            Termination::Exited(0) => Ok(StepOutcome {
                command_id,
                exit_code: 0,
                output: outcome.output,
            }),
            Termination::Exited(code) => Err(SaveError::Execution {
                command_id,
                exit_code: Some(code),
                message: format!("exit status {}", code),
                output: outcome.output,
            }),
            Termination::TimedOut(after) => Err(SaveError::Timeout { command_id, after }),
            Termination::Cancelled => Err(SaveError::Cancelled { command_id }),
        }
    }

    /// Runs the primary and every peer concurrently and waits for all of them.
    ///
    /// Fails up front only when the primary command does not exist; a missing
    /// peer is reported in its own slot.
    pub fn run_group(
        &self,
        store: &CommandStore,
        primary: u64,
        peers: &[u64],
        deadline: Option<Deadline>,
    ) -> Result<GroupOutcome> {
        let primary_raw = store.command(primary)?.raw.as_str();

        let mut slots: Vec<Option<Result<StepOutcome>>> = Vec::with_capacity(peers.len() + 1);
        let mut jobs: Vec<(usize, u64, &str)> = vec![(0, primary, primary_raw)];
        slots.push(None);
        for (offset, &peer) in peers.iter().enumerate() {
            match store.command(peer) {
                Ok(command) => {
                    slots.push(None);
                    jobs.push((offset + 1, peer, command.raw.as_str()));
                }
                Err(e) => slots.push(Some(Err(e))),
            }
        }

        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            for &(index, command_id, raw) in &jobs {
                let tx = tx.clone();
                scope.spawn(move || {
                    let result = self.run_text(command_id, raw, deadline);
                    let _ = tx.send((index, result));
                });
            }
        });
        drop(tx);
        for (index, result) in rx.iter().take(jobs.len()) {
            slots[index] = Some(result);
        }

        let mut results = slots.into_iter().zip(std::iter::once(primary).chain(peers.iter().copied()));
        let primary_result = match results.next() {
            Some((Some(result), _)) => result,
            _ => return Err(SaveError::command_not_found(primary)),
        };
        let peers = results
            .map(|(slot, id)| {
                let result = slot.unwrap_or_else(|| Err(SaveError::command_not_found(id)));
                (id, result)
            })
            .collect();

        Ok(GroupOutcome {
            primary: primary_result,
            peers,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store_manager::tests::{add, temp_store};
    use std::collections::HashMap;

    /// Answers from a table instead of spawning processes.
    #[derive(Default)]
    pub(crate) struct ScriptedShell {
        scripts: Mutex<HashMap<String, (i32, String)>>,
        invocations: Mutex<Vec<String>>,
    }

    impl ScriptedShell {
        pub(crate) fn set(&self, command: &str, exit_code: i32, output: &str) {
            self.scripts
                .lock()
                .unwrap()
                .insert(command.to_string(), (exit_code, output.to_string()));
        }

        pub(crate) fn invocations(&self) -> Vec<String> {
            self.invocations.lock().unwrap().clone()
        }
    }

    impl ShellRunner for ScriptedShell {
        fn run(&self, command: &str, _deadline: Option<Deadline>, cancel: &CancelToken) -> io::Result<ShellOutcome> {
            self.invocations.lock().unwrap().push(command.to_string());
            if cancel.is_cancelled() {
                return Ok(ShellOutcome { termination: Termination::Cancelled, output: String::new() });
            }
            let (code, output) = self
                .scripts
                .lock()
                .unwrap()
                .get(command)
                .cloned()
                .unwrap_or((0, String::new()));
            Ok(ShellOutcome { termination: Termination::Exited(code), output })
        }
    }

    #[test]
    fn captures_combined_output() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "echo out; echo err >&2");
        let shell = SystemShell::default();
        let executor = StepExecutor::new(&shell, CancelToken::new());

        let outcome = executor.run(&store, id, None).unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output.contains("out"));
        assert!(outcome.output.contains("err"));
    }

    #[test]
    fn non_zero_exit_carries_code_and_output() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "echo broken; exit 3");
        let shell = SystemShell::default();
        let executor = StepExecutor::new(&shell, CancelToken::new());

        let err = executor.run(&store, id, None).unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.captured_output(), Some("broken\n"));
    }

    #[test]
    fn deadline_kills_the_child() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "sleep 5");
        let shell = SystemShell::default();
        let executor = StepExecutor::new(&shell, CancelToken::new());

        let started = Instant::now();
        let err = executor
            .run(&store, id, Some(Deadline::after(Duration::from_millis(100))))
            .unwrap_err();
        assert!(matches!(err, SaveError::Timeout { command_id, .. } if command_id == id));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn background_process_does_not_outlive_the_deadline() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "sleep 5 & echo hi");
        let shell = SystemShell::default();
        let executor = StepExecutor::new(&shell, CancelToken::new());

        let started = Instant::now();
        let outcome = executor
            .run(&store, id, Some(Deadline::after(Duration::from_millis(300))))
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output.trim(), "hi");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn cancelled_token_stops_before_spawning() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "true");
        let shell = SystemShell::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let executor = StepExecutor::new(&shell, cancel);

        assert!(matches!(executor.run(&store, id, None), Err(SaveError::Cancelled { .. })));
    }

    #[test]
    fn missing_shell_is_an_execution_error() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "true");
        let shell = SystemShell::new("/nonexistent/shell");
        let executor = StepExecutor::new(&shell, CancelToken::new());

        let err = executor.run(&store, id, None).unwrap_err();
        assert!(matches!(err, SaveError::Execution { exit_code: None, .. }));
    }

    #[test]
    fn group_collects_every_result() {
        let (_dir, mut store) = temp_store();
        let primary = add(&mut store, "build");
        let ok_peer = add(&mut store, "lint");
        let bad_peer = add(&mut store, "test");
        let shell = ScriptedShell::default();
        shell.set("test", 1, "1 failed");
        let executor = StepExecutor::new(&shell, CancelToken::new());

        let group = executor
            .run_group(&store, primary, &[ok_peer, bad_peer, 99], None)
            .unwrap();
        assert!(group.primary.is_ok());
        assert_eq!(group.peers.len(), 3);
        assert_eq!(group.peers[0].0, ok_peer);
        assert!(group.peers[0].1.is_ok());
        assert_eq!(group.peers[1].1.as_ref().unwrap_err().exit_code(), Some(1));
        assert!(matches!(group.peers[2].1, Err(SaveError::NotFound { id: 99, .. })));
        assert_eq!(shell.invocations().len(), 3);
    }

    #[test]
    fn group_runs_concurrently() {
        let (_dir, mut store) = temp_store();
        let a = add(&mut store, "sleep 0.5");
        let b = add(&mut store, "sleep 0.5; exit 4");
        let shell = SystemShell::default();
        let executor = StepExecutor::new(&shell, CancelToken::new());

        let started = Instant::now();
        let group = executor.run_group(&store, a, &[b], None).unwrap();
        assert!(started.elapsed() < Duration::from_millis(950));
        assert!(group.primary.is_ok());
        assert_eq!(group.peers[0].1.as_ref().unwrap_err().exit_code(), Some(4));
    }
}

//! Sandbox execution primitives (C1 of the analysis pipeline).
//!
//! A [`Sandbox`] is a disposable isolated environment — container or scoped
//! filesystem — in which third-party analysis tools run against untrusted
//! repository contents. The contract is deliberately small: `acquire`,
//! `run`, `release`. Non-zero exit codes are a first-class signal, not a
//! [`SandboxError`] — tools commonly exit non-zero when they report
//! findings.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default virtual-memory rlimit applied to each sandboxed child, in MiB.
pub const DEFAULT_MEMORY_LIMIT_MIB: u64 = 512;

/// Output of one `run` invocation: stdout and stderr merged into a single
/// byte stream preserving interleaving order, plus the exit code.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
    pub duration: Duration,
}

/// Failure modes of [`Sandbox::run`] and [`Sandbox::acquire`]. Distinguished
/// from a non-zero exit, which is returned as `Ok` — tools routinely exit
/// non-zero to report findings.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("command exited non-zero: {0}")]
    NonZeroExit(i32),
    #[error("failed to execute command: {0}")]
    ExecFailed(#[source] std::io::Error),
    #[error("command exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("sandbox has already been released")]
    SandboxReleased,
    #[error("failed to acquire sandbox: {0}")]
    AcquireFailed(String),
}

/// A disposable execution context. `acquire`/`release` must be safe to call
/// concurrently from different jobs; per-job state is never shared between
/// instances.
pub trait Sandbox: Send + Sync {
    /// The directory tools should treat as the repository root once a clone
    /// has populated it.
    fn root(&self) -> &Path;

    /// Runs `argv` to completion (or until `deadline` elapses), returning
    /// merged stdout+stderr and the exit code. `non_zero_exit` is NOT an
    /// error variant of the `Result` — a non-zero exit is returned as
    /// `Ok(CommandOutput)`.
    fn run(&self, argv: &[&str], deadline: Duration) -> Result<CommandOutput, SandboxError>;

    /// Idempotent: safe to call more than once, and safe to call after a
    /// prior `run` failed. After `release`, every subsequent `run` fails
    /// with [`SandboxError::SandboxReleased`].
    fn release(&self);
}

/// `ANALYSER=filesystem`: each acquire creates a unique directory tree under
/// a writable base; `run` spawns a subprocess with environment scoped to
/// that tree; `release` removes the tree.
pub struct FilesystemSandbox {
    dir: tempfile::TempDir,
    memory_limit_mib: u64,
    released: AtomicBool,
}

impl FilesystemSandbox {
    /// `workdir_hint` becomes a prefix on the generated temp directory name
    /// so operators can eyeball which job a leftover directory belonged to.
    pub fn acquire(base: &Path, workdir_hint: &str) -> Result<Self, SandboxError> {
        Self::acquire_with_limit(base, workdir_hint, DEFAULT_MEMORY_LIMIT_MIB)
    }

    pub fn acquire_with_limit(
        base: &Path,
        workdir_hint: &str,
        memory_limit_mib: u64,
    ) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(base)
            .map_err(|e| SandboxError::AcquireFailed(e.to_string()))?;
        let sanitized: String = workdir_hint
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect();
        let dir = tempfile::Builder::new()
            .prefix(&format!("inspectd-{sanitized}-"))
            .tempdir_in(base)
            .map_err(|e| SandboxError::AcquireFailed(e.to_string()))?;
        Ok(Self {
            dir,
            memory_limit_mib,
            released: AtomicBool::new(false),
        })
    }

    fn spawn(&self, argv: &[&str]) -> std::io::Result<(Child, MergedOutput)> {
        let (program, args) = argv
            .split_first()
            .expect("run() requires a non-empty argv");
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(self.dir.path())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", self.dir.path());

        apply_memory_limit(&mut command, self.memory_limit_mib);
        spawn_with_merged_output(command)
    }
}

impl Sandbox for FilesystemSandbox {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn run(&self, argv: &[&str], deadline: Duration) -> Result<CommandOutput, SandboxError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SandboxError::SandboxReleased);
        }

        let start = Instant::now();
        let (mut child, merged) = self.spawn(argv).map_err(SandboxError::ExecFailed)?;
        let wait_deadline = start + deadline;

        loop {
            match child
                .try_wait()
                .map_err(SandboxError::ExecFailed)?
            {
                Some(status) => {
                    let output = merged.join();
                    return Ok(CommandOutput {
                        exit_code: status.code().unwrap_or(-1),
                        output,
                        duration: start.elapsed(),
                    });
                }
                None => {
                    if Instant::now() >= wait_deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = merged.join();
                        return Err(SandboxError::DeadlineExceeded(deadline));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        // The TempDir guard removes the tree when `self.dir` drops; nothing
        // further to do here beyond flipping the released flag so future
        // `run` calls are rejected.
    }
}

/// A background thread draining the merged stdout+stderr pipe while the
/// child runs, so a chatty tool can't fill the pipe buffer and deadlock
/// against the poll loop in [`Sandbox::run`].
struct MergedOutput {
    reader: std::thread::JoinHandle<Vec<u8>>,
}

impl MergedOutput {
    /// Blocks until the draining thread observes EOF (the child, and every
    /// process holding the write end, has exited) and returns what it read.
    fn join(self) -> String {
        let bytes = self.reader.join().unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Routes `command`'s stdout and stderr to the same end of one OS pipe
/// before spawning, so the kernel serializes the bytes in actual write
/// order. Two separately piped streams can't be re-interleaved after the
/// fact once each has been read to completion, so merging has to happen
/// before the child ever writes a byte.
fn spawn_with_merged_output(mut command: Command) -> std::io::Result<(Child, MergedOutput)> {
    let (reader, writer) = os_pipe::pipe()?;
    let writer_clone = writer.try_clone()?;
    command.stdout(Stdio::from(writer));
    command.stderr(Stdio::from(writer_clone));

    let child = command.spawn()?;
    // `command` (and with it, its two handles onto the pipe's write end) is
    // dropped here, at the end of this function — the only copies of the
    // write end left open are the ones duplicated into the child. Once the
    // child (and anything it forked) exits, `reader` sees EOF.
    let reader_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = reader;
        let _ = reader.read_to_end(&mut buf);
        buf
    });

    Ok((child, MergedOutput { reader: reader_thread }))
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn apply_memory_limit(command: &mut Command, memory_limit_mib: u64) {
    use std::os::unix::process::CommandExt;
    let bytes = memory_limit_mib.saturating_mul(1024 * 1024);
    // pre_exec runs in the forked child between fork and exec; setrlimit
    // here is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            let _ = rlimit::setrlimit(rlimit::Resource::AS, bytes, bytes);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_memory_limit(_command: &mut Command, _memory_limit_mib: u64) {}

/// `ANALYSER=docker`: each acquire creates and starts a container from a
/// configured image; `run` executes a shell command inside the container
/// under a bash login; `release` stops and removes the container (stop
/// timeout 1 second).
///
/// This is the extension point named in §4.1: the Orchestrator is agnostic
/// between sandbox variants, so swapping `ANALYSER=docker` in for
/// `ANALYSER=filesystem` requires no code change at call sites. The runtime
/// binding to an actual container engine is left to the operator's image
/// and `container_runtime` binary configuration.
pub struct ContainerSandbox {
    image: String,
    container_runtime: PathBuf,
    container_id: std::sync::Mutex<Option<String>>,
    released: AtomicBool,
}

impl ContainerSandbox {
    pub fn acquire(image: impl Into<String>, container_runtime: PathBuf) -> Result<Self, SandboxError> {
        let image = image.into();
        let output = Command::new(&container_runtime)
            .args(["run", "-d", "--rm", &image, "sleep", "infinity"])
            .output()
            .map_err(|e| SandboxError::AcquireFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(SandboxError::AcquireFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self {
            image,
            container_runtime,
            container_id: std::sync::Mutex::new(Some(container_id)),
            released: AtomicBool::new(false),
        })
    }

    pub fn image(&self) -> &str {
        &self.image
    }
}

impl Sandbox for ContainerSandbox {
    fn root(&self) -> &Path {
        Path::new("/workspace")
    }

    fn run(&self, argv: &[&str], deadline: Duration) -> Result<CommandOutput, SandboxError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SandboxError::SandboxReleased);
        }
        let container_id = self
            .container_id
            .lock()
            .expect("container id mutex poisoned")
            .clone()
            .ok_or(SandboxError::SandboxReleased)?;

        let start = Instant::now();
        let mut exec = Command::new(&self.container_runtime);
        exec.args(["exec", &container_id, "bash", "-lc", &argv.join(" ")]);
        let (mut child, merged) = spawn_with_merged_output(exec).map_err(SandboxError::ExecFailed)?;
        let wait_deadline = start + deadline;

        loop {
            match child.try_wait().map_err(SandboxError::ExecFailed)? {
                Some(status) => {
                    let output = merged.join();
                    return Ok(CommandOutput {
                        exit_code: status.code().unwrap_or(-1),
                        output,
                        duration: start.elapsed(),
                    });
                }
                None => {
                    if Instant::now() >= wait_deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = merged.join();
                        return Err(SandboxError::DeadlineExceeded(deadline));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(container_id) = self.container_id.lock().expect("mutex poisoned").take() {
            let _ = Command::new(&self.container_runtime)
                .args(["stop", "-t", "1", &container_id])
                .output();
        }
    }
}

/// Which sandbox variant the operator selected via `ANALYSER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Filesystem,
    Docker,
}

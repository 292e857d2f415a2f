//! Process spawning inside a namespace
//!
//! Forks a child which enters a target network namespace, unshares mount and
//! UTS namespaces, remounts sysfs, sets the hostname, applies the host's
//! bind-mount map (faked `/etc` files) and finally execs the requested
//! command. The sequence matches what iproute2 does for `ip netns exec`,
//! extended with the per-host bind mounts.

use crate::netns::NetNs;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe, sethostname, ForkResult, Pid};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Argument contains a NUL byte")]
    BadArgument(#[from] std::ffi::NulError),

    #[error("Fork failed: {0}")]
    Fork(nix::Error),

    #[error("Wait failed: {0}")]
    Wait(nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a child's output stream goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stdio {
    #[default]
    Inherit,
    Null,
    Piped,
}

/// Stdio wiring for a spawned process. Stdin is always inherited.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl SpawnOptions {
    /// Discard both output streams.
    pub fn quiet() -> Self {
        Self {
            stdout: Stdio::Null,
            stderr: Stdio::Null,
        }
    }

    /// Capture stdout through a pipe.
    pub fn piped_stdout() -> Self {
        Self {
            stdout: Stdio::Piped,
            stderr: Stdio::Inherit,
        }
    }
}

/// A process running inside a host's namespace.
#[derive(Debug)]
pub struct Child {
    pid: Pid,
    /// Read side of the stdout pipe when spawned with [`Stdio::Piped`].
    pub stdout: Option<File>,
    /// Read side of the stderr pipe when spawned with [`Stdio::Piped`].
    pub stderr: Option<File>,
}

impl Child {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Wait for the child and return its exit code. A child killed by a
    /// signal reports `128 + signo` like the shell does.
    pub async fn wait(&mut self) -> Result<i32, SpawnError> {
        let pid = self.pid;
        tokio::task::spawn_blocking(move || loop {
            match waitpid(pid, None).map_err(SpawnError::Wait)? {
                WaitStatus::Exited(_, code) => return Ok(code),
                WaitStatus::Signaled(_, signal, _) => return Ok(128 + signal as i32),
                _ => continue,
            }
        })
        .await
        .map_err(|e| SpawnError::Io(std::io::Error::other(e)))?
    }
}

/// Fork and exec `argv` inside the given namespace.
///
/// Setup failures in the child surface as exit status 127; an unrunnable
/// command as 126. The parent observes both through [`Child::wait`].
pub(crate) fn spawn_in_namespace(
    ns: &NetNs,
    hostname: &str,
    mounts: &[(PathBuf, PathBuf)],
    argv: &[String],
    options: SpawnOptions,
) -> Result<Child, SpawnError> {
    if argv.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }

    // Everything the child needs is prepared before the fork; the child
    // only performs raw syscalls until exec.
    let args: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<_, _>>()?;
    let program = args[0].clone();
    let mount_pairs: Vec<(CString, CString)> = mounts
        .iter()
        .map(|(src, dst)| {
            Ok((
                CString::new(src.as_os_str().as_bytes())?,
                CString::new(dst.as_os_str().as_bytes())?,
            ))
        })
        .collect::<Result<_, SpawnError>>()?;

    let devnull = if options.stdout == Stdio::Null || options.stderr == Stdio::Null {
        Some(OpenOptions::new().write(true).open("/dev/null")?)
    } else {
        None
    };
    let stdout_pipe = pipe_for(options.stdout)?;
    let stderr_pipe = pipe_for(options.stderr)?;
    let ns_fd = ns.raw_fd();

    debug!("Spawning {:?} inside namespace {}", argv, ns.name());

    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Parent { child } => {
            // Write ends close with the drop of the pipe tuples; the read
            // ends are handed to the caller.
            let stdout = stdout_pipe.map(|(read, _write)| File::from(read));
            let stderr = stderr_pipe.map(|(read, _write)| File::from(read));
            Ok(Child {
                pid: child,
                stdout,
                stderr,
            })
        }
        ForkResult::Child => {
            let wiring = ChildWiring {
                devnull: devnull.as_ref().map(|f| f.as_raw_fd()),
                stdout: options.stdout,
                stderr: options.stderr,
                stdout_pipe: stdout_pipe.as_ref().map(|(r, w)| (r.as_raw_fd(), w.as_raw_fd())),
                stderr_pipe: stderr_pipe.as_ref().map(|(r, w)| (r.as_raw_fd(), w.as_raw_fd())),
            };
            if setup_child(ns_fd, hostname, &mount_pairs, &wiring).is_err() {
                unsafe { libc::_exit(127) };
            }
            let _ = execvp(&program, &args);
            unsafe { libc::_exit(126) };
        }
    }
}

/// Fork and exec `argv` in the caller's namespaces. Used by the root
/// container, whose lifecycle operations are otherwise no-ops.
pub(crate) fn spawn_root(argv: &[String], options: SpawnOptions) -> Result<Child, SpawnError> {
    if argv.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }

    let args: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<_, _>>()?;
    let program = args[0].clone();

    let devnull = if options.stdout == Stdio::Null || options.stderr == Stdio::Null {
        Some(OpenOptions::new().write(true).open("/dev/null")?)
    } else {
        None
    };
    let stdout_pipe = pipe_for(options.stdout)?;
    let stderr_pipe = pipe_for(options.stderr)?;

    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Parent { child } => {
            let stdout = stdout_pipe.map(|(read, _write)| File::from(read));
            let stderr = stderr_pipe.map(|(read, _write)| File::from(read));
            Ok(Child {
                pid: child,
                stdout,
                stderr,
            })
        }
        ForkResult::Child => {
            let wiring = ChildWiring {
                devnull: devnull.as_ref().map(|f| f.as_raw_fd()),
                stdout: options.stdout,
                stderr: options.stderr,
                stdout_pipe: stdout_pipe.as_ref().map(|(r, w)| (r.as_raw_fd(), w.as_raw_fd())),
                stderr_pipe: stderr_pipe.as_ref().map(|(r, w)| (r.as_raw_fd(), w.as_raw_fd())),
            };
            if wire_stdio(&wiring).is_err() {
                unsafe { libc::_exit(127) };
            }
            let _ = execvp(&program, &args);
            unsafe { libc::_exit(126) };
        }
    }
}

fn pipe_for(mode: Stdio) -> Result<Option<(OwnedFd, OwnedFd)>, SpawnError> {
    match mode {
        Stdio::Piped => {
            let (read, write) = pipe().map_err(|e| SpawnError::Io(std::io::Error::from(e)))?;
            Ok(Some((read, write)))
        }
        _ => Ok(None),
    }
}

struct ChildWiring {
    devnull: Option<RawFd>,
    stdout: Stdio,
    stderr: Stdio,
    stdout_pipe: Option<(RawFd, RawFd)>,
    stderr_pipe: Option<(RawFd, RawFd)>,
}

/// Runs between fork and exec; only raw syscalls, no allocation.
fn setup_child(
    ns_fd: RawFd,
    hostname: &str,
    mounts: &[(CString, CString)],
    wiring: &ChildWiring,
) -> Result<(), nix::Error> {
    // Enter the target network namespace.
    setns(
        unsafe { BorrowedFd::borrow_raw(ns_fd) },
        CloneFlags::empty(),
    )?;

    // New mount namespace for the bind mounts, new UTS namespace for the
    // hostname.
    unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS)?;

    // Make our mounts slave, otherwise unsharing does not help against
    // shared propagation.
    mount(
        Some("none"),
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_SLAVE,
        None::<&str>,
    )?;

    // Remount sysfs so it reflects this network namespace.
    umount2("/sys", MntFlags::MNT_DETACH)?;
    mount(
        Some("none"),
        "/sys",
        Some("sysfs"),
        MsFlags::empty(),
        None::<&str>,
    )?;

    sethostname(hostname)?;

    // Faked /etc files.
    for (src, dst) in mounts {
        mount(
            Some(src.as_c_str()),
            dst.as_c_str(),
            Some("none"),
            MsFlags::MS_BIND,
            None::<&str>,
        )?;
    }

    wire_stdio(wiring)
}

fn wire_stdio(wiring: &ChildWiring) -> Result<(), nix::Error> {
    redirect(1, wiring.stdout, wiring.stdout_pipe, wiring.devnull)?;
    redirect(2, wiring.stderr, wiring.stderr_pipe, wiring.devnull)?;

    // The pipe fds are duplicated onto 1/2 now; drop the originals so the
    // exec'd program only sees its standard streams.
    for pipe_fds in [wiring.stdout_pipe, wiring.stderr_pipe].into_iter().flatten() {
        let _ = close(pipe_fds.0);
        let _ = close(pipe_fds.1);
    }
    if let Some(null) = wiring.devnull {
        let _ = close(null);
    }
    Ok(())
}

fn redirect(
    target: RawFd,
    mode: Stdio,
    pipe_fds: Option<(RawFd, RawFd)>,
    devnull: Option<RawFd>,
) -> Result<(), nix::Error> {
    match mode {
        Stdio::Inherit => {}
        Stdio::Null => {
            if let Some(null) = devnull {
                dup2(null, target)?;
            }
        }
        Stdio::Piped => {
            if let Some((_read, write)) = pipe_fds {
                dup2(write, target)?;
            }
        }
    }
    Ok(())
}

//! Attaching to, stopping, and releasing the target process

use log::{debug, warn};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::errors::RemoteError;

fn ptrace_err(op: &'static str, pid: Pid, source: nix::Error) -> RemoteError {
    RemoteError::Ptrace {
        op,
        pid: pid.as_raw(),
        source,
    }
}

/// `PTRACE_ATTACH` and wait until the tracee is quiescent.
///
/// The stop we are owed is the attach SIGSTOP. A tracee racing through
/// execve may report a SIGTRAP first; that one is swallowed and the wait
/// continues. Any other stop signal is re-delivered so the target observes
/// it after we are done.
pub fn attach(pid: Pid) -> Result<(), RemoteError> {
    ptrace::attach(pid).map_err(|e| ptrace_err("ATTACH", pid, e))?;
    loop {
        let status =
            waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(|source| RemoteError::Wait {
                pid: pid.as_raw(),
                source,
            })?;
        let deliver = match status {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                debug!("attached to {}", pid);
                return Ok(());
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => None,
            WaitStatus::Stopped(_, sig) => Some(sig),
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Err(RemoteError::TargetExited(pid.as_raw()));
            }
            other => {
                debug!("unexpected wait status {:?} while attaching", other);
                None
            }
        };
        ptrace::cont(pid, deliver).map_err(|e| ptrace_err("CONT", pid, e))?;
    }
}

/// `PTRACE_DETACH`; valid once per successful [`attach`]
pub fn detach(pid: Pid) -> Result<(), RemoteError> {
    ptrace::detach(pid, None).map_err(|e| ptrace_err("DETACH", pid, e))
}

/// Step the tracee over exactly one instruction and wait for its trap.
///
/// Used to drive the spliced syscall instruction: the kernel runs the whole
/// syscall and delivers SIGTRAP with the instruction pointer just past it.
/// A SIGSEGV means the splice site went wrong and is fatal; pending signals
/// are re-delivered and the step retried.
pub fn single_step(pid: Pid) -> Result<(), RemoteError> {
    let mut deliver: Option<Signal> = None;
    loop {
        ptrace::step(pid, deliver).map_err(|e| ptrace_err("SINGLESTEP", pid, e))?;
        let status =
            waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(|source| RemoteError::Wait {
                pid: pid.as_raw(),
                source,
            })?;
        deliver = match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) | WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                return Ok(());
            }
            WaitStatus::Stopped(_, Signal::SIGSEGV) => {
                warn!("tracee {} faulted at the splice site", pid);
                return Err(RemoteError::TargetFault(pid.as_raw()));
            }
            WaitStatus::Stopped(_, sig) => Some(sig),
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Err(RemoteError::TargetExited(pid.as_raw()));
            }
            _ => None,
        };
    }
}

/// Resume the tracee and block until it stops again on SIGSTOP or SIGTRAP.
///
/// A SIGSEGV in the tracee is fatal to the operation; the caller must
/// restore whatever it spliced before surfacing the error. Other signals
/// are re-delivered and the wait continues.
pub fn wait_for_stop(pid: Pid) -> Result<(), RemoteError> {
    let mut deliver: Option<Signal> = None;
    loop {
        ptrace::cont(pid, deliver).map_err(|e| ptrace_err("CONT", pid, e))?;
        let status =
            waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(|source| RemoteError::Wait {
                pid: pid.as_raw(),
                source,
            })?;
        deliver = match status {
            WaitStatus::Stopped(_, Signal::SIGSTOP) | WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                return Ok(());
            }
            WaitStatus::Stopped(_, Signal::SIGSEGV) => {
                warn!("tracee {} faulted", pid);
                return Err(RemoteError::TargetFault(pid.as_raw()));
            }
            WaitStatus::Stopped(_, sig) => Some(sig),
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                return Err(RemoteError::TargetExited(pid.as_raw()));
            }
            _ => None,
        };
    }
}

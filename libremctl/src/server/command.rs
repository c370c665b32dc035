// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Running a permitted command and multiplexing its output.
//!
//! The child gets socket pairs for its standard streams, an engineered
//! environment describing the authenticated caller, and optionally
//! dropped privileges. The parent concurrently drains both output
//! streams, feeds any standard input data, and watches for child exit,
//! so a command that fills one pipe while the other is silent can
//! never deadlock the session. Output is delivered through a
//! [`ResponseSink`], which is where the per-protocol buffering rules
//! live.

use std::{
    collections::HashMap,
    ffi::{CString, OsStr, OsString},
    fs::File,
    io::{Read as _, Write as _},
    net::IpAddr,
    os::fd::{AsFd as _, AsRawFd as _, OwnedFd, RawFd},
    os::unix::ffi::{OsStrExt as _, OsStringExt as _},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::{
        signal::{signal, SigHandler, Signal},
        socket::{shutdown, socketpair, AddressFamily, Shutdown, SockFlag, SockType},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{dup2, execve, fork, initgroups, setgid, setuid, ForkResult, Pid, Uid},
};
use tracing::{debug, info, warn};

use crate::{
    consts,
    server::config::{Rule, StdinArg},
};
use remctl_protocol::ErrorCode;

/// Everything the child environment needs to know about the caller.
pub struct CommandContext<'a> {
    /// The authenticated principal.
    pub user: &'a str,
    /// The client's IP address, when there is a network peer.
    pub addr: Option<IpAddr>,
    /// The client's hostname, when reverse resolution produced one.
    pub hostname: Option<&'a str>,
    /// Unix timestamp at which the caller's credentials expire.
    pub expires: u64,
}

/// Where command results go. The network server implements this per
/// protocol version, the ssh transport passes streams through, and the
/// tests collect events. Sink errors mean the transport is gone and
/// are fatal to the session.
pub trait ResponseSink {
    /// True when standard output and standard error share one channel
    /// (protocol v1 semantics).
    fn merge_streams(&self) -> bool {
        false
    }
    fn output(&mut self, stream: u8, data: &[u8]) -> anyhow::Result<()>;
    fn status(&mut self, status: u8) -> anyhow::Result<()>;
    fn error(&mut self, code: ErrorCode, message: &str) -> anyhow::Result<()>;
}

/// Run a permitted command to completion: spawn, multiplex, reap, and
/// send the terminal message. Execution failures are reported to the
/// client and do not fail the session; only sink errors propagate.
pub fn run_command(
    rule: &Rule,
    ctx: &CommandContext,
    argv: &[Vec<u8>],
    sink: &mut dyn ResponseSink,
) -> anyhow::Result<()> {
    let (child_args, stdin_data) = apply_stdin(rule, argv);
    match spawn_and_pump(rule, ctx, argv, &child_args, stdin_data, sink)? {
        PumpResult::Exited(code) => sink.status(code as u8),
        PumpResult::Signaled => sink.error(ErrorCode::Internal, "Internal failure"),
        PumpResult::Reported => Ok(()),
    }
}

/// The outcome of one child run.
pub enum PumpResult {
    /// Clean exit with this status.
    Exited(i32),
    /// Killed by a signal.
    Signaled,
    /// A failure was already reported to the client.
    Reported,
}

/// Spawn the configured program and drain it, leaving the terminal
/// message to the caller so the help meta-command can merge several
/// runs into one response.
pub fn spawn_and_pump(
    rule: &Rule,
    ctx: &CommandContext,
    argv: &[Vec<u8>],
    child_args: &[&[u8]],
    stdin_data: Option<Vec<u8>>,
    sink: &mut dyn ResponseSink,
) -> anyhow::Result<PumpResult> {
    // Build everything the child will exec with before forking, while
    // allocation is still safe and failures can still be reported.
    let exec = match prepare_exec(rule, ctx, argv, child_args) {
        Ok(exec) => exec,
        Err(e) => {
            warn!("cannot prepare command: {:#}", e);
            sink.error(ErrorCode::BadCommand, ErrorCode::BadCommand.message())?;
            return Ok(PumpResult::Reported);
        }
    };

    let merged = sink.merge_streams();
    let (inout_parent, inout_child) = match socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("cannot create stdin and stdout socket pair: {}", e);
            sink.error(ErrorCode::Internal, "Internal failure")?;
            return Ok(PumpResult::Reported);
        }
    };
    let stderr_pair = if merged {
        None
    } else {
        match socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()) {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!("cannot create stderr socket pair: {}", e);
                sink.error(ErrorCode::Internal, "Internal failure")?;
                return Ok(PumpResult::Reported);
            }
        }
    };

    // Safety: the child branch only calls exec-safe operations and
    // ends in execve or process exit.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            let err_fd = stderr_pair.as_ref().map(|(_, child_side)| child_side.as_raw_fd());
            let mut parent_fds = vec![inout_parent.as_raw_fd()];
            if let Some((parent_side, _)) = &stderr_pair {
                parent_fds.push(parent_side.as_raw_fd());
            }
            let err = child_setup_and_exec(
                inout_child.as_raw_fd(),
                err_fd,
                &parent_fds,
                stdin_data.is_some(),
                rule,
                &exec,
            );
            eprintln!("cannot execute: {err:#}");
            std::process::exit(255);
        }
        Err(e) => {
            warn!("cannot fork: {}", e);
            sink.error(ErrorCode::Internal, "Internal failure")?;
            return Ok(PumpResult::Reported);
        }
    };

    // Close the child sides in the parent so EOF propagates.
    drop(inout_child);
    let stderr_parent = stderr_pair.map(|(parent_side, child_side)| {
        drop(child_side);
        parent_side
    });

    set_nonblocking(inout_parent.as_raw_fd());
    if let Some(fd) = &stderr_parent {
        set_nonblocking(fd.as_raw_fd());
    }

    pump(pid, inout_parent, stderr_parent, stdin_data, sink)
}

/// The pre-built exec image: program, argv, and environment, all
/// converted to C strings before the fork.
struct ExecImage {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

fn prepare_exec(
    rule: &Rule,
    ctx: &CommandContext,
    argv: &[Vec<u8>],
    child_args: &[&[u8]],
) -> anyhow::Result<ExecImage> {
    let program = CString::new(rule.program.as_os_str().as_bytes())
        .context("program path contains a nul byte")?;

    // argv[0] is the basename of the program, the same convention a
    // shell would use.
    let basename = rule
        .program
        .file_name()
        .unwrap_or_else(|| OsStr::new("command"))
        .as_bytes();
    let mut exec_argv = Vec::with_capacity(child_args.len() + 1);
    exec_argv.push(CString::new(basename).context("program name contains a nul byte")?);
    for arg in child_args {
        exec_argv.push(CString::new(*arg).context("argument contains a nul byte")?);
    }

    // The inherited environment plus the connection metadata. REMUSER
    // is kept alongside REMOTE_USER for backward compatibility.
    let mut env: HashMap<OsString, OsString> = std::env::vars_os().collect();
    env.insert(OsString::from("REMUSER"), OsString::from(ctx.user));
    env.insert(OsString::from("REMOTE_USER"), OsString::from(ctx.user));
    if let Some(addr) = ctx.addr {
        env.insert(OsString::from("REMOTE_ADDR"), OsString::from(addr.to_string()));
    }
    if let Some(hostname) = ctx.hostname {
        env.insert(OsString::from("REMOTE_HOST"), OsString::from(hostname));
    }
    if let Some(command) = argv.first() {
        env.insert(
            OsString::from("REMCTL_COMMAND"),
            OsString::from(String::from_utf8_lossy(command).into_owned()),
        );
    }
    env.insert(OsString::from("REMOTE_EXPIRES"), OsString::from(ctx.expires.to_string()));

    let mut envp = Vec::with_capacity(env.len());
    for (key, value) in env {
        let mut entry = key.into_vec();
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        // Skip anything unencodable rather than failing the command.
        if let Ok(entry) = CString::new(entry) {
            envp.push(entry);
        }
    }

    Ok(ExecImage { program, argv: exec_argv, envp })
}

/// Post-fork setup in the child. Only returns on failure; the caller
/// reports the error on the inherited stderr and exits 255.
fn child_setup_and_exec(
    inout: RawFd,
    errout: Option<RawFd>,
    parent_fds: &[RawFd],
    has_stdin: bool,
    rule: &Rule,
    exec: &ExecImage,
) -> anyhow::Error {
    // The server sides of the socket pairs are the parent's business.
    for fd in parent_fds {
        let _ = nix::unistd::close(*fd);
    }

    // Wire up the standard descriptors first, then close everything
    // else. If there is no input data the child reads EOF from
    // /dev/null; closing fd 0 outright confuses some programs.
    if has_stdin {
        if let Err(e) = dup2(inout, 0) {
            return anyhow::Error::new(e).context("duping stdin");
        }
    } else {
        // Safety: plain libc descriptor plumbing; fd 0 was just closed
        // so open may legitimately return it.
        unsafe {
            libc::close(0);
            let fd =
                libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY);
            if fd > 0 {
                libc::dup2(fd, 0);
                libc::close(fd);
            }
        }
    }
    if let Err(e) = dup2(inout, 1) {
        return anyhow::Error::new(e).context("duping stdout");
    }
    let stderr_target = errout.unwrap_or(inout);
    if let Err(e) = dup2(stderr_target, 2) {
        return anyhow::Error::new(e).context("duping stderr");
    }

    // The originals are dup'd onto 0-2 now.
    if inout > 2 {
        let _ = nix::unistd::close(inout);
    }
    if let Some(fd) = errout {
        if fd > 2 {
            let _ = nix::unistd::close(fd);
        }
    }

    // Close remaining low descriptors so the GSS-API replay cache and
    // the client socket do not leak into the command.
    for fd in 3..=consts::CHILD_MAX_INHERITED_FD {
        let _ = nix::unistd::close(fd);
    }

    // The server ignores SIGPIPE; the command gets the default set.
    // Safety: installing a default handler is always valid.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        return anyhow::Error::new(e).context("restoring SIGPIPE");
    }

    if let Some(user) = &rule.user {
        if Uid::effective().is_root() {
            let name = match CString::new(user.name.as_bytes()) {
                Ok(name) => name,
                Err(e) => return anyhow::Error::new(e).context("user name"),
            };
            if let Err(e) = initgroups(&name, user.gid) {
                return anyhow::Error::new(e)
                    .context(format!("initgroups for {}", user.name));
            }
            if let Err(e) = setgid(user.gid) {
                return anyhow::Error::new(e).context(format!("setgid to {}", user.gid));
            }
            if let Err(e) = setuid(user.uid) {
                return anyhow::Error::new(e).context(format!("setuid to {}", user.uid));
            }
        }
    }

    match execve(&exec.program, &exec.argv, &exec.envp) {
        Ok(infallible) => match infallible {},
        Err(e) => anyhow::Error::new(e).context(format!("executing {:?}", exec.program)),
    }
}

/// Drain the child's output sockets and feed its input, reacting to
/// child exit. Readiness-driven so neither stream can starve or
/// deadlock the other, with a bounded final drain once the child has
/// been reaped so orphaned descriptor holders cannot stall the server.
fn pump(
    pid: Pid,
    inout: OwnedFd,
    errout: Option<OwnedFd>,
    stdin_data: Option<Vec<u8>>,
    sink: &mut dyn ResponseSink,
) -> anyhow::Result<PumpResult> {
    let mut inout = Some(File::from(inout));
    let mut errout = errout.map(File::from);
    let mut stdin = stdin_data.map(|data| (data, 0usize));
    // No input at all: shut down the write side immediately so the
    // child sees EOF if it reads.
    if stdin.is_none() {
        if let Some(f) = &inout {
            let _ = shutdown(f.as_raw_fd(), Shutdown::Write);
        }
    }

    let mut buf = vec![0u8; consts::BUF_SIZE];
    let mut reaped = false;
    let mut wait_status = None;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if !reaped {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                    debug!("child {} exited: {:?}", pid, status);
                    reaped = true;
                    wait_status = Some(status);
                    drain_deadline = Some(Instant::now() + consts::FINAL_DRAIN_TIMEOUT);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("waitpid for {} failed: {}", pid, e);
                    reaped = true;
                    drain_deadline = Some(Instant::now());
                }
            }
        }

        if inout.is_none() && errout.is_none() {
            break;
        }
        if let Some(deadline) = drain_deadline {
            if Instant::now() >= deadline {
                debug!("child exited with output descriptors still open, ending drain");
                break;
            }
        }

        // Wake up periodically to re-check the child even if the
        // streams are idle; once reaped, poll without blocking.
        let timeout_ms: u16 = if reaped {
            0
        } else {
            consts::CHILD_POLL_TIMEOUT.as_millis() as u16
        };

        let mut inout_events = PollFlags::empty();
        let mut errout_events = PollFlags::empty();
        {
            let mut fds = Vec::with_capacity(2);
            let mut inout_idx = None;
            let mut errout_idx = None;
            if let Some(f) = &inout {
                let mut interest = PollFlags::POLLIN;
                if stdin.is_some() {
                    interest |= PollFlags::POLLOUT;
                }
                inout_idx = Some(fds.len());
                fds.push(PollFd::new(f.as_fd(), interest));
            }
            if let Some(f) = &errout {
                errout_idx = Some(fds.len());
                fds.push(PollFd::new(f.as_fd(), PollFlags::POLLIN));
            }

            let nready = match poll(&mut fds, timeout_ms) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("poll failed: {}", e);
                    sink.error(ErrorCode::Internal, "Internal failure")?;
                    reap_if_needed(pid, reaped);
                    return Ok(PumpResult::Reported);
                }
            };
            if nready == 0 && reaped {
                // Nothing pending in the final pass; we are done even
                // if a grandchild still holds the sockets open.
                break;
            }

            if let Some(i) = inout_idx {
                inout_events = fds[i].revents().unwrap_or(PollFlags::empty());
            }
            if let Some(i) = errout_idx {
                errout_events = fds[i].revents().unwrap_or(PollFlags::empty());
            }
        }

        // Write pending stdin data before reading so a child blocked
        // on its input cannot stall the round.
        if inout_events.contains(PollFlags::POLLOUT) {
            let mut stdin_done = false;
            if let (Some(f), Some((data, off))) = (inout.as_mut(), stdin.as_mut()) {
                match f.write(&data[*off..]) {
                    Ok(n) => {
                        *off += n;
                        if *off >= data.len() {
                            let _ = shutdown(f.as_raw_fd(), Shutdown::Write);
                            stdin_done = true;
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e)
                        if e.kind() == std::io::ErrorKind::BrokenPipe
                            || e.kind() == std::io::ErrorKind::ConnectionReset =>
                    {
                        // The child exited or closed stdin without
                        // reading everything. Not an error.
                        debug!("child stopped reading stdin");
                        stdin_done = true;
                    }
                    Err(e) => {
                        warn!("write to command stdin failed: {}", e);
                        sink.error(ErrorCode::Internal, "Internal failure")?;
                        reap_if_needed(pid, reaped);
                        return Ok(PumpResult::Reported);
                    }
                }
            }
            if stdin_done {
                stdin = None;
            }
        }

        let read_flags = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        if inout_events.intersects(read_flags) {
            match drain_stream(inout.as_mut(), 1, &mut buf, sink)? {
                StreamState::Open => {}
                StreamState::Closed => inout = None,
                StreamState::Failed => {
                    reap_if_needed(pid, reaped);
                    return Ok(PumpResult::Reported);
                }
            }
        }
        if errout_events.intersects(read_flags) {
            match drain_stream(errout.as_mut(), 2, &mut buf, sink)? {
                StreamState::Open => {}
                StreamState::Closed => errout = None,
                StreamState::Failed => {
                    reap_if_needed(pid, reaped);
                    return Ok(PumpResult::Reported);
                }
            }
        }
    }

    if !reaped {
        wait_status = match waitpid(pid, None) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("waitpid for {} failed: {}", pid, e);
                None
            }
        };
    }

    match wait_status {
        Some(WaitStatus::Exited(_, code)) => Ok(PumpResult::Exited(code)),
        Some(WaitStatus::Signaled(_, sig, _)) => {
            info!("child {} killed by {}", pid, sig);
            Ok(PumpResult::Signaled)
        }
        _ => {
            sink.error(ErrorCode::Internal, "Internal failure")?;
            Ok(PumpResult::Reported)
        }
    }
}

enum StreamState {
    Open,
    Closed,
    Failed,
}

fn drain_stream(
    file: Option<&mut File>,
    stream: u8,
    buf: &mut [u8],
    sink: &mut dyn ResponseSink,
) -> anyhow::Result<StreamState> {
    let Some(f) = file else {
        return Ok(StreamState::Closed);
    };
    match f.read(buf) {
        Ok(0) => Ok(StreamState::Closed),
        Ok(n) => {
            sink.output(stream, &buf[..n])?;
            Ok(StreamState::Open)
        }
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::Interrupted =>
        {
            Ok(StreamState::Open)
        }
        Err(e)
            if e.kind() == std::io::ErrorKind::ConnectionReset =>
        {
            Ok(StreamState::Closed)
        }
        Err(e) => {
            warn!("read from command failed: {}", e);
            sink.error(ErrorCode::Internal, "Internal failure")?;
            Ok(StreamState::Failed)
        }
    }
}

fn reap_if_needed(pid: Pid, reaped: bool) {
    if !reaped {
        let _ = waitpid(pid, None);
    }
}

fn set_nonblocking(fd: RawFd) {
    // Safety: fcntl flag twiddling on a descriptor we own.
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl >= 0 {
            libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
        }
    }
}

/// Split the request argv into the child's arguments and the bytes, if
/// any, destined for its standard input. The type and subcommand are
/// consumed by dispatch; stdin positions count from 1 within what
/// remains.
pub fn apply_stdin<'a>(rule: &Rule, argv: &'a [Vec<u8>]) -> (Vec<&'a [u8]>, Option<Vec<u8>>) {
    let args: Vec<&[u8]> = argv.iter().skip(2).map(|a| a.as_slice()).collect();
    let index = match rule.stdin_arg {
        None => None,
        Some(StdinArg::Last) if args.is_empty() => None,
        Some(StdinArg::Last) => Some(args.len() - 1),
        Some(StdinArg::Index(n)) => {
            if n <= args.len() {
                Some(n - 1)
            } else {
                None
            }
        }
    };
    match index {
        None => (args, None),
        Some(i) => {
            let stdin = args[i].to_vec();
            let mut rest = args;
            rest.remove(i);
            (rest, Some(stdin))
        }
    }
}

/// Unix timestamp for a credential expiry time.
pub fn unix_expires(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Append output to a capped buffer, silently discarding the excess.
/// Protocol v1 responses carry only the first chunk of output.
pub fn append_capped(buf: &mut Vec<u8>, data: &[u8], cap: usize) {
    if buf.len() >= cap {
        return;
    }
    let room = cap - buf.len();
    buf.extend_from_slice(&data[..data.len().min(room)]);
}

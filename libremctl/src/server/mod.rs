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

//! The remctld engine: load the configuration, acquire acceptor
//! credentials, and serve connections either from a standalone TCP
//! listener or from the socket inetd handed us on standard input.

use std::{
    fs,
    net::{IpAddr, Ipv4Addr, TcpListener, TcpStream},
    os::fd::FromRawFd as _,
    path::PathBuf,
    sync::Arc,
    thread,
};

use anyhow::{bail, Context as _};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::{error, info};

pub mod acl;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod session;
pub mod shell;
mod signals;

use crate::{consts, gss};

/// Server invocation options, straight from the remctld command line.
pub struct Options {
    pub config_path: PathBuf,
    /// Run a standalone listener instead of expecting a connection on
    /// standard input.
    pub standalone: bool,
    /// Listener port; 0 means the registered default.
    pub port: u16,
    /// Addresses to bind in standalone mode. Empty means the wildcard
    /// address.
    pub binds: Vec<IpAddr>,
    /// Restrict acceptor credentials to this service principal instead
    /// of accepting for anything in the keytab.
    pub service: Option<String>,
    pub pid_file: Option<PathBuf>,
}

/// Run the server until terminated.
pub fn run(opts: Options) -> anyhow::Result<()> {
    ignore_sigpipe()?;
    let config = Arc::new(config::Config::load(&opts.config_path)?);
    let cred = gss::acquire_server_creds(opts.service.as_deref())?;

    if opts.standalone {
        serve_standalone(opts, config, cred)
    } else {
        serve_stdio(config, cred)
    }
}

/// The server must survive clients and children that go away mid-write;
/// children get the default disposition back before exec.
pub(crate) fn ignore_sigpipe() -> anyhow::Result<()> {
    // Safety: installing SIG_IGN is always valid.
    unsafe {
        signal(Signal::SIGPIPE, SigHandler::SigIgn).context("ignoring SIGPIPE")?;
    }
    Ok(())
}

/// inetd style: the accepted connection arrives as our stdin/stdout.
fn serve_stdio(config: Arc<config::Config>, cred: libgssapi::credential::Cred) -> anyhow::Result<()> {
    // Safety: we take a duplicate so the TcpStream owns a descriptor
    // of its own and fd 0 stays valid for the process lifetime.
    let fd = unsafe { libc::dup(0) };
    if fd < 0 {
        bail!("cannot duplicate stdin: {}", std::io::Error::last_os_error());
    }
    // Safety: fd is a fresh descriptor we own; inetd guarantees it is
    // the connection socket.
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    session::handle_connection(stream, cred, &config)
}

fn serve_standalone(
    opts: Options,
    config: Arc<config::Config>,
    cred: libgssapi::credential::Cred,
) -> anyhow::Result<()> {
    let port = if opts.port == 0 { consts::DEFAULT_PORT } else { opts.port };
    let binds = if opts.binds.is_empty() {
        vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]
    } else {
        opts.binds
    };

    let mut listeners = Vec::with_capacity(binds.len());
    for addr in &binds {
        let listener = TcpListener::bind((*addr, port))
            .with_context(|| format!("binding to {addr} port {port}"))?;
        info!("listening on {} port {}", addr, port);
        listeners.push(listener);
    }

    if let Some(pid_file) = &opts.pid_file {
        fs::write(pid_file, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {}", pid_file.display()))?;
    }
    // spawn the signal handler thread in the background
    signals::Handler::new(opts.pid_file.clone()).spawn()?;

    // One accept loop per bound address, one worker thread per
    // connection. The configuration is immutable and shared read-only.
    let mut accept_threads = Vec::new();
    for listener in listeners {
        let config = Arc::clone(&config);
        let cred = cred.clone();
        accept_threads.push(thread::spawn(move || serve_listener(listener, config, cred)));
    }
    for handle in accept_threads {
        match handle.join() {
            Ok(()) => {}
            Err(panic_err) => std::panic::resume_unwind(panic_err),
        }
    }
    Ok(())
}

fn serve_listener(
    listener: TcpListener,
    config: Arc<config::Config>,
    cred: libgssapi::credential::Cred,
) {
    let mut conn_counter = 0usize;
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                conn_counter += 1;
                let conn_id = conn_counter;
                let config = Arc::clone(&config);
                let cred = cred.clone();
                thread::spawn(move || {
                    if let Err(err) = session::handle_connection(stream, cred, &config) {
                        error!("handling connection {}: {:?}", conn_id, err);
                    }
                });
            }
            Err(err) => {
                error!("accepting stream: {:?}", err);
            }
        }
    }
}

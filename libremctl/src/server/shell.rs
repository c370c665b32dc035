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

//! The ssh transport: remctl-shell runs as a forced command under
//! sshd, so authentication already happened and the command arrives in
//! SSH_ORIGINAL_COMMAND. Dispatch, ACLs, and the subprocess engine are
//! exactly the network server's; only the transport differs, with
//! output passed straight through to the inherited descriptors.

use std::{
    env,
    io::{self, Write as _},
    net::IpAddr,
    path::PathBuf,
};

use anyhow::{anyhow, bail, Context as _};
use tracing::info;

use crate::{
    resolve,
    server::{
        command::{CommandContext, ResponseSink},
        config::Config,
        dispatch,
    },
};
use remctl_protocol::ErrorCode;

/// remctl-shell invocation options.
pub struct ShellOptions {
    pub config_path: PathBuf,
    /// The authenticated remote user; REMCTL_USER from the
    /// authorized_keys environment when not given explicitly.
    pub user: Option<String>,
    /// The command string; SSH_ORIGINAL_COMMAND when not given via -c.
    pub command: Option<String>,
    /// Suppress the diagnostic normally printed for protocol errors.
    pub quiet: bool,
}

/// Run one command as the restricted shell and return the exit status
/// for the process.
pub fn run(opts: ShellOptions) -> anyhow::Result<i32> {
    super::ignore_sigpipe()?;
    let config = Config::load(&opts.config_path)?;

    let user = match opts.user {
        Some(user) => user,
        None => env::var("REMCTL_USER")
            .map_err(|_| anyhow!("REMCTL_USER not set in the environment"))?,
    };
    let command = match opts.command {
        Some(command) => command,
        None => env::var("SSH_ORIGINAL_COMMAND")
            .map_err(|_| anyhow!("SSH_ORIGINAL_COMMAND not set in the environment"))?,
    };

    let words = shell_words::split(&command)
        .with_context(|| format!("parsing command {command:?}"))?;
    if words.is_empty() {
        bail!("empty command");
    }
    let argv: Vec<Vec<u8>> = words.into_iter().map(String::into_bytes).collect();

    // SSH_CLIENT is "ip port port"; only the address matters here.
    let addr: Option<IpAddr> = env::var("SSH_CLIENT")
        .ok()
        .and_then(|v| v.split_whitespace().next().map(String::from))
        .and_then(|ip| ip.parse().ok());
    let hostname = addr.as_ref().and_then(resolve::reverse_lookup);

    info!("ssh command from {}", user);
    let cmd_ctx = CommandContext {
        user: &user,
        addr,
        hostname: hostname.as_deref(),
        expires: 0,
    };
    let mut sink = ShellSink { status: 0, quiet: opts.quiet };
    dispatch::dispatch(&config, &cmd_ctx, &argv, &mut sink)?;
    Ok(sink.status)
}

/// Pass-through sink: the child's streams go to our own stdout and
/// stderr, protocol errors become a diagnostic and exit status 255.
struct ShellSink {
    status: i32,
    quiet: bool,
}

impl ResponseSink for ShellSink {
    fn output(&mut self, stream: u8, data: &[u8]) -> anyhow::Result<()> {
        if stream == 2 {
            let mut err = io::stderr().lock();
            err.write_all(data).context("writing to stderr")?;
        } else {
            let mut out = io::stdout().lock();
            out.write_all(data).context("writing to stdout")?;
            out.flush().context("flushing stdout")?;
        }
        Ok(())
    }

    fn status(&mut self, status: u8) -> anyhow::Result<()> {
        self.status = i32::from(status);
        Ok(())
    }

    fn error(&mut self, _code: ErrorCode, message: &str) -> anyhow::Result<()> {
        if !self.quiet {
            eprintln!("{message}");
        }
        self.status = 255;
        Ok(())
    }
}

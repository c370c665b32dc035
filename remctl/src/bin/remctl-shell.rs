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

//! The restricted shell variant of the server, meant to be configured
//! as a forced command (or login shell) for dedicated ssh accounts.
//! Authentication is sshd's problem; the command comes from
//! SSH_ORIGINAL_COMMAND and the caller identity from REMCTL_USER.

use std::path::PathBuf;

use clap::Parser;
use libremctl::{logging, server::shell};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[clap(
    name = "remctl-shell",
    about = "Restricted shell running remctl commands over ssh"
)]
struct Args {
    #[clap(short = 'c', help = "Command to run (default: SSH_ORIGINAL_COMMAND)")]
    command: Option<String>,

    #[clap(short = 'd', action, help = "Enable debugging output")]
    debug: bool,

    #[clap(
        short = 'f',
        default_value = "/etc/remctl/remctl.conf",
        help = "Configuration file"
    )]
    config: PathBuf,

    #[clap(short = 'q', action, help = "Suppress protocol error diagnostics")]
    quiet: bool,

    #[clap(short = 'S', action, help = "Log to standard error/output instead of syslog")]
    log_stderr: bool,

    #[clap(short = 'v', action, help = "Print version and exit")]
    version: bool,

    #[clap(help = "Remote user (default: REMCTL_USER)")]
    user: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.version {
        println!("remctl-shell {VERSION}");
        return Ok(());
    }
    logging::init_daemon("remctl-shell", args.log_stderr, args.debug)?;

    let status = shell::run(shell::ShellOptions {
        config_path: args.config,
        user: args.user,
        command: args.command,
        quiet: args.quiet,
    })?;
    std::process::exit(status);
}

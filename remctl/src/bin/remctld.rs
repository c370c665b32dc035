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

//! The remctld server binary. By default it expects to be run from
//! inetd with the connection on standard input; -m runs a standalone
//! listener instead.

use std::{net::IpAddr, path::PathBuf};

use clap::Parser;
use libremctl::{logging, server};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[clap(name = "remctld", about = "Server for remote execution using GSS-API Kerberos v5")]
struct Args {
    #[clap(short = 'b', help = "Address to bind in standalone mode, may repeat")]
    bind: Vec<IpAddr>,

    #[clap(short = 'd', action, help = "Enable debugging output")]
    debug: bool,

    #[clap(
        short = 'f',
        default_value = "/etc/remctl/remctl.conf",
        help = "Configuration file"
    )]
    config: PathBuf,

    #[clap(short = 'm', action, help = "Run a standalone listener instead of under inetd")]
    standalone: bool,

    #[clap(short = 'P', help = "Write the listener pid to this file (standalone mode)")]
    pid_file: Option<PathBuf>,

    #[clap(short = 'p', default_value_t = 0, help = "Port for standalone mode (default: 4373)")]
    port: u16,

    #[clap(short = 'S', action, help = "Log to standard error/output instead of syslog")]
    log_stderr: bool,

    #[clap(short = 's', help = "Service principal to accept for (default: whole keytab)")]
    service: Option<String>,

    #[clap(short = 'v', action, help = "Print version and exit")]
    version: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.version {
        println!("remctld {VERSION}");
        return Ok(());
    }
    logging::init_daemon("remctld", args.log_stderr, args.debug)?;

    server::run(server::Options {
        config_path: args.config,
        standalone: args.standalone,
        port: args.port,
        binds: args.bind,
        service: args.service,
        pid_file: args.pid_file,
    })
}

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

//! The remctl command-line client: a thin adapter from arguments to
//! the client library. Exit status mirrors the remote command, with
//! 255 reserved for protocol-level errors.

use std::{
    io::{self, Write as _},
    net::IpAddr,
    time::Duration,
};

use clap::Parser;
use libremctl::{logging, Client, OutputEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[clap(name = "remctl", about = "Remote execution client using GSS-API Kerberos v5")]
struct Args {
    #[clap(short = 'b', help = "Source IP address to bind when connecting")]
    source: Option<IpAddr>,

    #[clap(short = 'd', action, help = "Enable debugging output")]
    debug: bool,

    #[clap(
        short = 'p',
        default_value_t = 0,
        help = "Server port (default: 4373, falling back to 4444)"
    )]
    port: u16,

    #[clap(short = 's', help = "Service principal of the server (default: host/<host>)")]
    service: Option<String>,

    #[clap(short = 't', help = "Timeout in seconds for each network operation")]
    timeout: Option<u64>,

    #[clap(short = 'v', action, help = "Print version and exit")]
    version: bool,

    #[clap(help = "Host to connect to")]
    host: Option<String>,

    #[clap(help = "Command type, service, and arguments", trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() {
    let args = Args::parse();
    if args.version {
        println!("remctl {VERSION}");
        return;
    }
    logging::init_client(args.debug);

    let Some(host) = args.host else {
        eprintln!("remctl: no host given");
        std::process::exit(255);
    };
    if args.command.len() < 2 {
        eprintln!("remctl: usage: remctl <host> <type> <service> [args...]");
        std::process::exit(255);
    }

    std::process::exit(run(&host, &args.command, &args));
}

fn run(host: &str, command: &[String], args: &Args) -> i32 {
    let mut client = Client::new();
    if let Some(secs) = args.timeout {
        client.set_timeout(Some(Duration::from_secs(secs)));
    }
    if let Some(source) = args.source {
        client.set_source_ip(source);
    }

    if let Err(e) = client.open(host, args.port, args.service.as_deref()) {
        eprintln!("remctl: {e:#}");
        return 255;
    }
    if let Err(e) = client.command(command) {
        eprintln!("remctl: {e:#}");
        return 255;
    }

    loop {
        match client.output() {
            Ok(OutputEvent::Output { stream: 2, data }) => {
                let mut err = io::stderr().lock();
                let _ = err.write_all(&data);
            }
            Ok(OutputEvent::Output { data, .. }) => {
                let mut out = io::stdout().lock();
                if out.write_all(&data).and_then(|()| out.flush()).is_err() {
                    return 255;
                }
            }
            Ok(OutputEvent::Status(status)) => {
                client.close();
                return i32::from(status);
            }
            Ok(OutputEvent::Error { message, .. }) => {
                eprintln!("remctl: {}", String::from_utf8_lossy(&message));
                client.close();
                return 255;
            }
            Ok(OutputEvent::Done) => {
                // Shouldn't happen before a terminal message, but
                // treat it as a clean end of output.
                return 0;
            }
            Err(e) => {
                eprintln!("remctl: {e:#}");
                return 255;
            }
        }
    }
}

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

//! Logging setup for the binaries. The daemons log to syslog unless
//! asked to stay on stderr; the client only logs when debugging.

use std::{io, sync::Mutex};

use syslog::{Facility, Formatter3164};

/// Initialize tracing for a daemon process. `to_stderr` selects plain
/// stderr output (the -S flag); otherwise lines go to syslog under the
/// given process name.
pub fn init_daemon(process: &str, to_stderr: bool, debug: bool) -> anyhow::Result<()> {
    let level = if debug { tracing::Level::DEBUG } else { tracing::Level::INFO };
    if to_stderr {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
        return Ok(());
    }

    let formatter = Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: String::from(process),
        pid: std::process::id(),
    };
    match syslog::unix(formatter) {
        Ok(logger) => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_target(false)
                .with_ansi(false)
                .without_time()
                .with_writer(Mutex::new(SyslogWriter(logger)))
                .init();
        }
        Err(_) => {
            // No syslog socket (containers, chroots). Fall back to
            // stderr but keep it to warnings, since for remctl-shell
            // stderr doubles as the error stream the remote peer sees.
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::WARN)
                .with_target(false)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Initialize tracing for the client: stderr, and only when asked.
pub fn init_client(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
    }
}

/// Adapts the syslog crate's message-oriented logger to the io::Write
/// interface tracing-subscriber expects.
struct SyslogWriter(syslog::Logger<syslog::LoggerBackend, Formatter3164>);

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        let line = line.trim_end();
        if !line.is_empty() {
            self.0
                .info(line)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

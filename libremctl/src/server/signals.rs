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

//! Termination handling for the standalone listener: remove the pid
//! file and exit on the first termination signal, die immediately on
//! the second so a stuck shutdown cannot ignore the operator.

use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    thread,
};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::{error, info};

pub struct Handler {
    pid_file: Option<PathBuf>,
}

impl Handler {
    pub fn new(pid_file: Option<PathBuf>) -> Self {
        Handler { pid_file }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        // Arm a second-signal hard exit before registering the flag
        // that arms it. Registration order matters: reversed, the
        // first signal would both arm and kill.
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))
                .context("registering conditional shutdown")?;
            flag::register(*sig, Arc::clone(&term_now)).context("registering term flag")?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            if let Some(signal) = (&mut signals).into_iter().next() {
                info!("caught signal {}, shutting down", signal);
                if let Some(pid_file) = self.pid_file {
                    if let Err(e) = std::fs::remove_file(&pid_file) {
                        error!("removing pid file {}: {}", pid_file.display(), e);
                    }
                }
                std::process::exit(0);
            }
        });

        Ok(())
    }
}

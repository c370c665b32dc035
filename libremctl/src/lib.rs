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

//! libremctl implements the remctl protocol suite: a client library
//! for authenticated remote execution of predefined commands over
//! GSS-API (Kerberos v5), and the server engine behind remctld and
//! remctl-shell.
//!
//! Clients use [`client::Client`]: open a connection, send an argv,
//! and iterate output events until the exit status arrives. Servers
//! run [`server::run`] with [`server::Options`], which loads the
//! dispatch table from remctl.conf and serves connections either
//! standalone or under inetd. The wire format itself lives in the
//! remctl-protocol crate.

pub mod client;
pub mod consts;
pub mod gss;
pub mod logging;
mod resolve;
pub mod server;
pub mod tokens;

pub use client::{Client, OutputEvent};

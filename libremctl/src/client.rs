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

//! The client session: a single authenticated connection to a remctld
//! server over which commands are sent and output streamed back.
//!
//! Operations on one session are strictly sequential. A session moves
//! from empty, through open, into draining once a command has been
//! shipped, and back to open (protocol v2) or closed (protocol v1)
//! when the terminal status or error message arrives.

use std::{
    net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs as _},
    os::fd::{AsRawFd as _, OwnedFd},
    time::Duration,
};

use anyhow::{anyhow, bail, Context as _};
use libgssapi::context::ClientCtx;
use tracing::{debug, info};

use crate::{
    consts, gss, resolve,
    tokens::{Deadline, TokenError},
};
use remctl_protocol::{
    decode_v1_response, encode_args, flags, split_command, Message, MAX_MESSAGE,
    TOKEN_MAX_LENGTH,
};

/// One streamed result from a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A chunk of standard output (stream 1) or standard error
    /// (stream 2).
    Output { stream: u8, data: Vec<u8> },
    /// The command finished with this exit status. Terminal.
    Status(u8),
    /// The server refused or failed the command. Terminal.
    Error { code: u32, message: Vec<u8> },
    /// No more output; the previous command already finished.
    Done,
}

/// The transport and security context of an open session. The two are
/// only ever valid together, so they live and die together.
struct Conn {
    stream: TcpStream,
    context: ClientCtx,
}

impl Conn {
    fn send_v2_command(&mut self, body: &[u8], deadline: &Deadline) -> Result<(), TokenError> {
        for (cont, chunk) in split_command(body) {
            let msg = Message::Command { keepalive: true, cont, body: chunk.to_vec() };
            gss::send_priv(
                &mut self.context,
                &self.stream,
                flags::DATA | flags::PROTOCOL,
                &msg.encode(),
                deadline,
            )?;
        }
        Ok(())
    }

    fn send_v1_command(&mut self, body: &[u8], deadline: &Deadline) -> Result<(), TokenError> {
        if body.len() > TOKEN_MAX_LENGTH {
            // v1 has no fragmentation; there is nothing we can do.
            return Err(TokenError::Large { length: body.len(), max: TOKEN_MAX_LENGTH });
        }
        gss::send_priv(&mut self.context, &self.stream, flags::DATA, body, deadline)
    }

    fn send_msg(&mut self, msg: &Message, deadline: &Deadline) -> Result<(), TokenError> {
        gss::send_priv(
            &mut self.context,
            &self.stream,
            flags::DATA | flags::PROTOCOL,
            &msg.encode(),
            deadline,
        )
    }

    fn recv(&mut self, max: usize, deadline: &Deadline) -> Result<(u8, Vec<u8>), TokenError> {
        gss::recv_priv(&mut self.context, &self.stream, max, deadline)
    }
}

/// A remctl client session.
#[derive(Default)]
pub struct Client {
    conn: Option<Conn>,
    protocol: u8,
    /// True between a fully sent command and its terminal message.
    ready: bool,
    /// Exit status buffered from a v1 combined response, delivered on
    /// the output call after the output data.
    v1_status: Option<u8>,
    timeout: Option<Duration>,
    source_ip: Option<IpAddr>,
    last_error: Option<String>,
}

impl Client {
    pub fn new() -> Client {
        Client::default()
    }

    /// The protocol version negotiated by `open`, or 0 before then.
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// The most recent error, kept for callers that lose the `Result`
    /// along the way (notably the language-binding shims). The returned
    /// `Result` of each operation is the primary reporting mechanism.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Set a whole-operation timeout applied to every subsequent
    /// operation, including `open`. `None` blocks indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Bind the local side of the connection to this source address.
    /// Only affects subsequent calls to `open`.
    pub fn set_source_ip(&mut self, addr: IpAddr) {
        self.source_ip = Some(addr);
    }

    /// Select the credential cache used for authentication.
    ///
    /// The underlying GSS-API binding does not expose the
    /// credential-cache selection primitive, so this always fails with
    /// an unsupported error; callers are expected to fall back to
    /// setting KRB5CCNAME before opening the connection. Note that the
    /// ticket cache is process-global state either way.
    pub fn set_ccache(&mut self, _path: &str) -> anyhow::Result<()> {
        Err(self.record(anyhow!("setting a credential cache is not supported, set KRB5CCNAME")))
    }

    /// Open a connection and establish the security context.
    ///
    /// Port 0 means the registered port with a fallback to the legacy
    /// port. The service principal defaults to `host/<canonical-host>`
    /// from a canonicalizing forward lookup, lowercased.
    pub fn open(&mut self, host: &str, port: u16, principal: Option<&str>) -> anyhow::Result<()> {
        if self.conn.is_some() {
            return Err(self.record(anyhow!("session is already open")));
        }
        let deadline = Deadline::start(self.timeout);

        let ports: &[u16] = if port == 0 {
            &[consts::DEFAULT_PORT, consts::LEGACY_PORT]
        } else {
            &[port]
        };
        let stream = match self.connect(host, ports, &deadline) {
            Ok(s) => s,
            Err(e) => return Err(self.record(e)),
        };

        let principal = match principal {
            Some(p) => String::from(p),
            None => {
                let canonical = match resolve::canonical_hostname(host) {
                    Ok(h) => h,
                    Err(e) => return Err(self.record(e)),
                };
                format!("host/{canonical}")
            }
        };
        debug!("authenticating to {} as {}", host, principal);

        match gss::initiate(&stream, &principal, &deadline) {
            Ok((context, protocol)) => {
                info!("opened connection to {} (protocol {})", host, protocol);
                self.conn = Some(Conn { stream, context });
                self.protocol = protocol;
                self.ready = false;
                Ok(())
            }
            Err(e) => Err(self.record(e.context("establishing security context"))),
        }
    }

    /// Send a command. The session must be open with no output pending.
    pub fn command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> anyhow::Result<()> {
        if self.ready {
            return Err(self.record(anyhow!("output from a previous command is still pending")));
        }
        if args.is_empty() {
            return Err(self.record(anyhow!("cannot send an empty command")));
        }

        let deadline = Deadline::start(self.timeout);
        let body = encode_args(args);
        let protocol = self.protocol;
        let result = match self.conn.as_mut() {
            None => return Err(self.record(anyhow!("session is not open"))),
            Some(conn) if protocol >= 2 => conn.send_v2_command(&body, &deadline),
            Some(conn) => conn.send_v1_command(&body, &deadline),
        };
        match result {
            Ok(()) => {
                self.ready = true;
                Ok(())
            }
            Err(e) => Err(self.fail_token(e, "sending command")),
        }
    }

    /// Read the next output event from the running command. Once a
    /// terminal `Status` or `Error` has been returned, further calls
    /// yield `Done`.
    pub fn output(&mut self) -> anyhow::Result<OutputEvent> {
        // A buffered v1 exit status is delivered after the output data,
        // and ends the connection: v1 servers handle one command per
        // connection.
        if let Some(status) = self.v1_status.take() {
            self.teardown();
            return Ok(OutputEvent::Status(status));
        }
        if !self.ready {
            return Ok(OutputEvent::Done);
        }

        let deadline = Deadline::start(self.timeout);
        if self.protocol >= 2 {
            self.v2_output(&deadline)
        } else {
            self.v1_output(&deadline)
        }
    }

    fn v2_output(&mut self, deadline: &Deadline) -> anyhow::Result<OutputEvent> {
        let result = match self.conn.as_mut() {
            None => return Err(self.record(anyhow!("session is not open"))),
            Some(conn) => conn.recv(MAX_MESSAGE, deadline),
        };
        let (token_flags, payload) = match result {
            Ok(t) => t,
            Err(e) => return Err(self.fail_token(e, "receiving output")),
        };
        if token_flags != flags::DATA | flags::PROTOCOL {
            return Err(self.record(anyhow!("unexpected token flags {token_flags} from server")));
        }
        match Message::decode(&payload) {
            Ok(Message::Output { stream, data }) => Ok(OutputEvent::Output { stream, data }),
            Ok(Message::Status { status }) => {
                self.ready = false;
                Ok(OutputEvent::Status(status))
            }
            Ok(Message::Error { code, message }) => {
                self.ready = false;
                Ok(OutputEvent::Error { code, message })
            }
            Ok(msg) => Err(self.record(anyhow!("unexpected message from server: {msg:?}"))),
            Err(e) => Err(self.record(anyhow!("malformed message from server: {e}"))),
        }
    }

    fn v1_output(&mut self, deadline: &Deadline) -> anyhow::Result<OutputEvent> {
        let result = match self.conn.as_mut() {
            None => return Err(self.record(anyhow!("session is not open"))),
            Some(conn) => conn.recv(TOKEN_MAX_LENGTH, deadline),
        };
        let (token_flags, payload) = match result {
            Ok(t) => t,
            Err(e) => return Err(self.fail_token(e, "receiving response")),
        };
        if token_flags != flags::DATA {
            return Err(self.record(anyhow!("unexpected token flags {token_flags} from server")));
        }
        let (status, output) = match decode_v1_response(&payload) {
            Ok(r) => r,
            Err(e) => return Err(self.record(anyhow!("malformed response from server: {e}"))),
        };
        self.ready = false;
        self.v1_status = Some(status as u8);
        Ok(OutputEvent::Output { stream: 1, data: output })
    }

    /// Send a protocol v3 noop and wait for the echo. Failure here just
    /// means the server does not support the extension; the caller can
    /// treat it as a capability probe.
    pub fn noop(&mut self) -> anyhow::Result<()> {
        if self.ready {
            return Err(self.record(anyhow!("output from a previous command is still pending")));
        }
        if self.protocol < 2 && self.conn.is_some() {
            return Err(self.record(anyhow!("noop is not supported by protocol version 1")));
        }

        let deadline = Deadline::start(self.timeout);
        let result = match self.conn.as_mut() {
            None => return Err(self.record(anyhow!("session is not open"))),
            Some(conn) => conn
                .send_msg(&Message::Noop, &deadline)
                .and_then(|()| conn.recv(MAX_MESSAGE, &deadline)),
        };
        let (_, payload) = match result {
            Ok(t) => t,
            Err(e) => return Err(self.fail_token(e, "exchanging noop")),
        };
        match Message::decode(&payload) {
            Ok(Message::Noop) => Ok(()),
            Ok(Message::Version { highest }) => {
                Err(self.record(anyhow!("server only supports protocol {highest}, not noop")))
            }
            Ok(msg) => Err(self.record(anyhow!("unexpected reply to noop: {msg:?}"))),
            Err(e) => Err(self.record(anyhow!("malformed reply to noop: {e}"))),
        }
    }

    /// Close the session, telling a v2 server we are going away if the
    /// session is idle.
    pub fn close(&mut self) {
        if self.protocol >= 2 && !self.ready {
            if let Some(conn) = self.conn.as_mut() {
                let deadline = Deadline::start(self.timeout);
                // Best effort; the server closing first is not an error.
                let _ = conn.send_msg(&Message::Quit, &deadline);
            }
        }
        self.teardown();
    }

    fn connect(
        &self,
        host: &str,
        ports: &[u16],
        deadline: &Deadline,
    ) -> anyhow::Result<TcpStream> {
        let mut last_err = None;
        for port in ports {
            let addrs = match (host, *port).to_socket_addrs() {
                Ok(addrs) => addrs,
                Err(e) => {
                    last_err = Some(anyhow!(e).context(format!("resolving {host}")));
                    continue;
                }
            };
            for addr in addrs {
                let attempt = match self.source_ip {
                    Some(source) => connect_from(source, &addr),
                    None => match deadline.remaining().map_err(|e| anyhow!(e))? {
                        Some(left) => TcpStream::connect_timeout(&addr, left)
                            .with_context(|| format!("connecting to {addr}")),
                        None => TcpStream::connect(addr)
                            .with_context(|| format!("connecting to {addr}")),
                    },
                };
                match attempt {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_err = Some(e),
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no usable addresses for {host}")))
    }

    fn teardown(&mut self) {
        self.conn = None;
        self.ready = false;
        self.v1_status = None;
    }

    /// Record an error in the session slot while passing it through.
    fn record(&mut self, e: anyhow::Error) -> anyhow::Error {
        self.last_error = Some(format!("{e:#}"));
        e
    }

    /// Token failures that indicate a dead or poisoned transport close
    /// the session: subsequent operations fail until the caller starts
    /// over.
    fn fail_token(&mut self, e: TokenError, what: &str) -> anyhow::Error {
        match e {
            TokenError::Timeout
            | TokenError::Eof
            | TokenError::System(_)
            | TokenError::GssApi(_) => self.teardown(),
            TokenError::Invalid(_) | TokenError::Large { .. } => {}
        }
        self.record(anyhow!(e).context(String::from(what)))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect with an explicitly bound source address. The standard
/// library cannot bind before connecting, so this goes through nix.
fn connect_from(source: IpAddr, addr: &SocketAddr) -> anyhow::Result<TcpStream> {
    use nix::sys::socket::{
        bind, connect, socket, AddressFamily, SockFlag, SockType, SockaddrStorage,
    };

    let same_family = matches!(
        (source, addr),
        (IpAddr::V4(_), SocketAddr::V4(_)) | (IpAddr::V6(_), SocketAddr::V6(_))
    );
    if !same_family {
        bail!("source address family does not match {addr}");
    }

    let family = match source {
        IpAddr::V4(_) => AddressFamily::Inet,
        IpAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd: OwnedFd = socket(family, SockType::Stream, SockFlag::empty(), None)
        .context("creating socket")?;
    let source_addr = SockaddrStorage::from(SocketAddr::new(source, 0));
    bind(fd.as_raw_fd(), &source_addr).with_context(|| format!("binding to {source}"))?;
    let dest = SockaddrStorage::from(*addr);
    connect(fd.as_raw_fd(), &dest).with_context(|| format!("connecting to {addr}"))?;
    Ok(TcpStream::from(fd))
}

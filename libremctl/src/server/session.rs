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

//! One server connection: handshake as acceptor, then either the
//! single-command protocol v1 exchange or the v2 message loop.
//!
//! Every token exchange carries the inactivity deadline, so a
//! connection that stops making forward progress is shut down rather
//! than pinning a worker forever.

use std::net::{IpAddr, TcpStream};

use anyhow::Context as _;
use libgssapi::{context::ServerCtx, credential::Cred};
use tracing::{debug, info, warn};

use crate::{
    consts, gss, resolve,
    server::{
        command::{append_capped, unix_expires, CommandContext, ResponseSink},
        config::Config,
        dispatch,
    },
    tokens::{Deadline, TokenError},
};
use remctl_protocol::{
    decode_args, encode_v1_response, flags, AssembleError, ArgsError, CommandAssembler,
    DecodeError, ErrorCode, Message, MAX_ARGS, MAX_MESSAGE, PROTOCOL_VERSION,
    TOKEN_MAX_LENGTH,
};

/// Accept and serve one client connection to completion. Transport and
/// GSS-API failures end the session; per-command failures are reported
/// to the client and the session continues where the protocol allows.
pub fn handle_connection(
    stream: TcpStream,
    cred: Cred,
    config: &Config,
) -> anyhow::Result<()> {
    let addr = stream.peer_addr().ok().map(|a| a.ip());
    let deadline = Deadline::start(Some(consts::INACTIVITY_TIMEOUT));
    let accepted = gss::accept(&stream, cred, &deadline).context("establishing context")?;
    info!(
        "accepted connection from {} (protocol {})",
        accepted.peer, accepted.protocol
    );

    let hostname = addr.as_ref().and_then(resolve::reverse_lookup);
    let mut session = Session {
        stream,
        ctx: accepted.ctx,
        user: accepted.peer,
        addr,
        hostname,
        expires: unix_expires(accepted.expires),
        config,
    };
    if accepted.protocol == 1 {
        session.run_v1()
    } else {
        session.run_v2()
    }
}

struct Session<'a> {
    stream: TcpStream,
    ctx: ServerCtx,
    user: String,
    addr: Option<IpAddr>,
    hostname: Option<String>,
    expires: u64,
    config: &'a Config,
}

impl Session<'_> {
    /// The v2 message loop: any number of commands, fragmented or not,
    /// until quit, keepalive expiry, or a fatal error.
    fn run_v2(&mut self) -> anyhow::Result<()> {
        let mut assembler = CommandAssembler::new();
        loop {
            let deadline = Deadline::start(Some(consts::INACTIVITY_TIMEOUT));
            let (token_flags, payload) =
                match gss::recv_priv(&mut self.ctx, &self.stream, MAX_MESSAGE, &deadline) {
                    Ok(t) => t,
                    Err(TokenError::Eof) => {
                        debug!("client closed the connection");
                        return Ok(());
                    }
                    Err(e @ TokenError::Invalid(_)) | Err(e @ TokenError::Large { .. }) => {
                        warn!("receiving command token: {}", e);
                        let _ = self.send_error(ErrorCode::BadToken);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("receiving command token: {}", e);
                        return Ok(());
                    }
                };
            if token_flags != flags::DATA | flags::PROTOCOL {
                warn!("bad token flags {} in command token", token_flags);
                let _ = self.send_error(ErrorCode::BadToken);
                return Ok(());
            }

            match Message::decode(&payload) {
                Ok(Message::Quit) => {
                    debug!("quit received, closing connection");
                    return Ok(());
                }
                Ok(Message::Noop) => {
                    debug!("answering noop");
                    self.send_msg(&Message::Noop)?;
                }
                Ok(Message::Command { keepalive, cont, body }) => {
                    match assembler.push(keepalive, cont, &body) {
                        Ok(None) => {}
                        Ok(Some((keepalive, complete))) => {
                            self.handle_command(&complete)?;
                            if !keepalive {
                                debug!("client did not ask for keep-alive, closing");
                                return Ok(());
                            }
                        }
                        Err(AssembleError::TooLarge) => {
                            warn!("fragmented command from {} too large", self.user);
                            self.send_error(ErrorCode::TooMuchData)?;
                        }
                        Err(AssembleError::IllOrdered(what)) => {
                            warn!("bad command continuation from {}: {}", self.user, what);
                            self.send_error(ErrorCode::BadCommand)?;
                        }
                    }
                }
                // The remaining message types only flow server to
                // client; a client sending one is confused.
                Ok(Message::Output { .. })
                | Ok(Message::Status { .. })
                | Ok(Message::Error { .. })
                | Ok(Message::Version { .. }) => {
                    self.send_error(ErrorCode::UnexpectedMessage)?;
                }
                Err(DecodeError::UnknownVersion(version)) => {
                    debug!("version {} from client, advertising ours", version);
                    self.send_msg(&Message::Version { highest: PROTOCOL_VERSION })?;
                }
                Err(DecodeError::UnknownType(msg_type)) => {
                    warn!("unknown message type {} from client", msg_type);
                    self.send_error(ErrorCode::UnknownMessage)?;
                }
                Err(DecodeError::Malformed(what)) => {
                    warn!("malformed message from client: {}", what);
                    self.send_error(ErrorCode::BadToken)?;
                }
            }
        }
    }

    fn handle_command(&mut self, body: &[u8]) -> anyhow::Result<()> {
        let argv = match decode_args(body, MAX_ARGS) {
            Ok(argv) => argv,
            Err(ArgsError::BadCount(n)) if n > MAX_ARGS => {
                warn!("invalid argc {} in request from {}", n, self.user);
                return self.send_error(ErrorCode::TooManyArgs);
            }
            Err(e) => {
                warn!("invalid command token from {}: {}", self.user, e);
                return self.send_error(ErrorCode::BadCommand);
            }
        };
        let cmd_ctx = CommandContext {
            user: &self.user,
            addr: self.addr,
            hostname: self.hostname.as_deref(),
            expires: self.expires,
        };
        let mut sink = V2Sink { stream: &self.stream, ctx: &mut self.ctx };
        dispatch::dispatch(self.config, &cmd_ctx, &argv, &mut sink)
    }

    /// The v1 exchange: exactly one command and one combined response.
    fn run_v1(&mut self) -> anyhow::Result<()> {
        let deadline = Deadline::start(Some(consts::INACTIVITY_TIMEOUT));
        let (token_flags, payload) =
            match gss::recv_priv(&mut self.ctx, &self.stream, TOKEN_MAX_LENGTH, &deadline) {
                Ok(t) => t,
                Err(TokenError::Eof) => return Ok(()),
                Err(e @ TokenError::Invalid(_)) | Err(e @ TokenError::Large { .. }) => {
                    warn!("receiving v1 command token: {}", e);
                    return self.send_v1_error(ErrorCode::BadToken);
                }
                Err(e) => {
                    warn!("receiving v1 command token: {}", e);
                    return Ok(());
                }
            };
        if token_flags != flags::DATA {
            warn!("bad token flags {} in v1 command token", token_flags);
            return self.send_v1_error(ErrorCode::BadToken);
        }

        let argv = match decode_args(&payload, MAX_ARGS) {
            Ok(argv) => argv,
            Err(e) => {
                warn!("invalid v1 command token from {}: {}", self.user, e);
                return self.send_v1_error(ErrorCode::BadCommand);
            }
        };
        let cmd_ctx = CommandContext {
            user: &self.user,
            addr: self.addr,
            hostname: self.hostname.as_deref(),
            expires: self.expires,
        };
        let mut sink =
            V1Sink { stream: &self.stream, ctx: &mut self.ctx, output: Vec::new() };
        dispatch::dispatch(self.config, &cmd_ctx, &argv, &mut sink)
    }

    fn send_msg(&mut self, msg: &Message) -> anyhow::Result<()> {
        let deadline = Deadline::start(Some(consts::INACTIVITY_TIMEOUT));
        gss::send_priv(
            &mut self.ctx,
            &self.stream,
            flags::DATA | flags::PROTOCOL,
            &msg.encode(),
            &deadline,
        )
        .context("sending message")
    }

    fn send_error(&mut self, code: ErrorCode) -> anyhow::Result<()> {
        self.send_msg(&Message::Error {
            code: code as u32,
            message: code.message().as_bytes().to_vec(),
        })
    }

    fn send_v1_error(&mut self, code: ErrorCode) -> anyhow::Result<()> {
        let mut sink = V1Sink { stream: &self.stream, ctx: &mut self.ctx, output: Vec::new() };
        sink.error(code, code.message())
    }
}

/// Protocol v2 responses: output streamed as it happens, split into
/// chunks that fit inside a token.
struct V2Sink<'a> {
    stream: &'a TcpStream,
    ctx: &'a mut ServerCtx,
}

impl V2Sink<'_> {
    fn send(&mut self, msg: &Message) -> anyhow::Result<()> {
        let deadline = Deadline::start(Some(consts::INACTIVITY_TIMEOUT));
        gss::send_priv(
            self.ctx,
            self.stream,
            flags::DATA | flags::PROTOCOL,
            &msg.encode(),
            &deadline,
        )
        .context("sending message")
    }
}

impl ResponseSink for V2Sink<'_> {
    fn output(&mut self, stream: u8, data: &[u8]) -> anyhow::Result<()> {
        for chunk in data.chunks(remctl_protocol::MAX_OUTPUT_DATA) {
            self.send(&Message::Output { stream, data: chunk.to_vec() })?;
        }
        Ok(())
    }

    fn status(&mut self, status: u8) -> anyhow::Result<()> {
        self.send(&Message::Status { status })
    }

    fn error(&mut self, code: ErrorCode, message: &str) -> anyhow::Result<()> {
        self.send(&Message::Error {
            code: code as u32,
            message: message.as_bytes().to_vec(),
        })
    }
}

/// Protocol v1 responses: output merged and buffered, then delivered
/// together with the exit status in one token. The buffer keeps only
/// the first chunk of oversized output.
struct V1Sink<'a> {
    stream: &'a TcpStream,
    ctx: &'a mut ServerCtx,
    output: Vec<u8>,
}

impl V1Sink<'_> {
    fn send_response(&mut self, status: u32) -> anyhow::Result<()> {
        let deadline = Deadline::start(Some(consts::INACTIVITY_TIMEOUT));
        let token = encode_v1_response(status, &self.output);
        gss::send_priv(self.ctx, self.stream, flags::DATA, &token, &deadline)
            .context("sending v1 response")
    }
}

impl ResponseSink for V1Sink<'_> {
    fn merge_streams(&self) -> bool {
        true
    }

    fn output(&mut self, _stream: u8, data: &[u8]) -> anyhow::Result<()> {
        append_capped(&mut self.output, data, consts::V1_MAX_OUTPUT);
        Ok(())
    }

    fn status(&mut self, status: u8) -> anyhow::Result<()> {
        self.send_response(u32::from(status))
    }

    fn error(&mut self, _code: ErrorCode, message: &str) -> anyhow::Result<()> {
        // v1 has no error messages; the text merges into the output
        // and the status goes out as -1.
        append_capped(&mut self.output, message.as_bytes(), consts::V1_MAX_OUTPUT);
        self.send_response(u32::MAX)
    }
}

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

//! The GSS-API layer: context establishment as initiator or acceptor,
//! interleaved with protocol version negotiation, and the private token
//! send/receive primitives that wrap payloads with confidentiality and
//! integrity once a context exists.

use std::{
    net::TcpStream,
    time::{Duration, SystemTime},
};

use anyhow::{anyhow, bail, Context as _};
use libgssapi::{
    context::{ClientCtx, CtxFlags, SecurityContext, ServerCtx},
    credential::{Cred, CredUsage},
    name::Name,
    oid::{OidSet, GSS_MECH_KRB5, GSS_NT_KRB5_PRINCIPAL},
};
use tracing::debug;

use crate::{
    consts,
    tokens::{self, Deadline, TokenError},
};
use remctl_protocol::{flags, TOKEN_MAX_LENGTH};

/// Context flags both sides must end up with: mutual authentication,
/// replay detection, confidentiality, and integrity.
pub fn required_flags() -> CtxFlags {
    CtxFlags::GSS_C_MUTUAL_FLAG
        | CtxFlags::GSS_C_REPLAY_FLAG
        | CtxFlags::GSS_C_CONF_FLAG
        | CtxFlags::GSS_C_INTEG_FLAG
}

/// Wrap a payload with confidentiality and send it as one token.
pub fn send_priv<C: SecurityContext>(
    ctx: &mut C,
    stream: &TcpStream,
    token_flags: u8,
    payload: &[u8],
    deadline: &Deadline,
) -> Result<(), TokenError> {
    let wrapped = ctx.wrap(true, payload).map_err(|e| TokenError::GssApi(e.to_string()))?;
    tokens::send_token_timeout(stream, token_flags, &wrapped, deadline)
}

/// Receive one token and unwrap its payload. `max` bounds the plaintext
/// length; the outer frame is always allowed up to the wire maximum to
/// leave room for the wrapping overhead. A failed unwrap is fatal to
/// the session.
pub fn recv_priv<C: SecurityContext>(
    ctx: &mut C,
    stream: &TcpStream,
    max: usize,
    deadline: &Deadline,
) -> Result<(u8, Vec<u8>), TokenError> {
    let (token_flags, wrapped) =
        tokens::recv_token_timeout(stream, TOKEN_MAX_LENGTH, deadline)?;
    let plain = ctx.unwrap(&wrapped).map_err(|e| TokenError::GssApi(e.to_string()))?;
    if plain.len() > max {
        return Err(TokenError::Large { length: plain.len(), max });
    }
    Ok((token_flags, plain.to_vec()))
}

/// Classify the flags of a connection's first token. v2-capable clients
/// set the protocol bit from the start; anything else valid is a v1
/// client.
pub fn initial_protocol(token_flags: u8) -> Option<u8> {
    if token_flags == flags::INIT_V2 {
        Some(2)
    } else if token_flags == flags::INIT_V1 {
        Some(1)
    } else {
        None
    }
}

/// Run the context establishment loop as the initiator.
///
/// Sends the initial negotiation token claiming protocol v2, then
/// drives `init_sec_context` until the context completes, downgrading
/// to v1 permanently if any server reply arrives without the protocol
/// bit. Returns the established context and the negotiated protocol
/// version. Dropping the context on any error path deletes the partial
/// security context.
pub fn initiate(
    stream: &TcpStream,
    principal: &str,
    deadline: &Deadline,
) -> anyhow::Result<(ClientCtx, u8)> {
    let mut desired_mechs = OidSet::new().context("creating mech OID set")?;
    desired_mechs.add(&GSS_MECH_KRB5).context("requesting krb5 mech")?;

    let name = Name::new(principal.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL))
        .with_context(|| format!("importing principal {principal}"))?
        .canonicalize(Some(&GSS_MECH_KRB5))
        .context("canonicalizing principal")?;
    let cred = Cred::acquire(None, None, CredUsage::Initiate, Some(&desired_mechs))
        .context("acquiring initiator credentials")?;
    let mut ctx = ClientCtx::new(Some(cred), name, required_flags(), Some(&GSS_MECH_KRB5));

    let mut protocol = 2u8;
    tokens::send_token_timeout(stream, flags::INIT_V2, &[], deadline)
        .context("sending initial token")?;

    let mut server_tok: Option<Vec<u8>> = None;
    loop {
        let out = ctx
            .step(server_tok.as_deref(), None)
            .context("initializing security context")?;
        if let Some(tok) = out {
            if !tok.is_empty() {
                debug!("sending context token (size={})", tok.len());
                let mut token_flags = flags::CONTEXT;
                if protocol == 2 {
                    token_flags |= flags::PROTOCOL;
                }
                tokens::send_token_timeout(stream, token_flags, &tok, deadline)
                    .context("sending context token")?;
            }
        }
        if ctx.is_complete() {
            break;
        }

        let (token_flags, payload) =
            tokens::recv_token_timeout(stream, consts::MAX_HANDSHAKE_TOKEN, deadline)
                .context("receiving context token")?;
        debug!("received context token (size={})", payload.len());
        if token_flags & flags::CONTEXT == 0 {
            bail!("bad token flags {token_flags} in context token");
        }
        if protocol == 2 && token_flags & flags::PROTOCOL == 0 {
            debug!("server does not speak protocol v2, downgrading");
            protocol = 1;
        }
        server_tok = Some(payload);
    }

    // Downgraded v1 sessions are talking to servers that predate these
    // flags, so only hold v2 peers to them.
    if protocol == 2 {
        let got = ctx.flags().context("reading context flags")?;
        if !got.contains(required_flags()) {
            bail!("server did not negotiate appropriate GSS-API flags");
        }
    }

    Ok((ctx, protocol))
}

/// What the acceptor learns from a completed handshake.
pub struct Accepted {
    pub ctx: ServerCtx,
    pub protocol: u8,
    /// The canonical principal of the authenticated peer.
    pub peer: String,
    /// When the peer's credentials expire.
    pub expires: SystemTime,
}

/// Run the context establishment loop as the acceptor. The protocol
/// version is fixed by the initial token and confirmed against every
/// context token that follows.
pub fn accept(stream: &TcpStream, cred: Cred, deadline: &Deadline) -> anyhow::Result<Accepted> {
    let (token_flags, _) =
        tokens::recv_token_timeout(stream, consts::MAX_HANDSHAKE_TOKEN, deadline)
            .context("receiving initial token")?;
    let mut protocol = initial_protocol(token_flags)
        .ok_or_else(|| anyhow!("bad token flags {token_flags} in initial token"))?;

    let mut ctx = ServerCtx::new(Some(cred));
    loop {
        let (token_flags, payload) =
            tokens::recv_token_timeout(stream, consts::MAX_HANDSHAKE_TOKEN, deadline)
                .context("receiving context token")?;
        if token_flags == flags::CONTEXT {
            protocol = 1;
        } else if token_flags != flags::CONTEXT | flags::PROTOCOL {
            bail!("bad token flags {token_flags} in context token");
        }
        debug!("received context token (size={})", payload.len());

        let out = ctx.step(&payload).context("accepting security context")?;
        if let Some(tok) = out {
            if !tok.is_empty() {
                debug!("sending context token (size={})", tok.len());
                let mut reply_flags = flags::CONTEXT;
                if protocol == 2 {
                    reply_flags |= flags::PROTOCOL;
                }
                tokens::send_token_timeout(stream, reply_flags, &tok, deadline)
                    .context("sending context token")?;
            }
        }
        if ctx.is_complete() {
            break;
        }
    }

    if protocol == 2 {
        let got = ctx.flags().context("reading context flags")?;
        if !got.contains(required_flags()) {
            bail!("client did not negotiate appropriate GSS-API flags");
        }
    }

    let peer = ctx.source_name().context("reading client principal")?.to_string();
    let lifetime = ctx.lifetime().unwrap_or(Duration::ZERO);
    Ok(Accepted { ctx, protocol, peer, expires: SystemTime::now() + lifetime })
}

/// Acquire acceptor credentials from the local keytab, optionally
/// restricted to a single service principal.
pub fn acquire_server_creds(service: Option<&str>) -> anyhow::Result<Cred> {
    let mut mechs = OidSet::new().context("creating mech OID set")?;
    mechs.add(&GSS_MECH_KRB5).context("requesting krb5 mech")?;

    let name = match service {
        Some(principal) => Some(
            Name::new(principal.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL))
                .with_context(|| format!("importing service principal {principal}"))?,
        ),
        None => None,
    };
    Cred::acquire(name.as_ref(), None, CredUsage::Accept, Some(&mechs))
        .context("acquiring acceptor credentials from keytab")
}

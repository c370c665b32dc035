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

//! Wire-level types and codecs for the remctl protocol.
//!
//! A remctl connection exchanges *tokens*: a one byte flag field, a four
//! byte big-endian length, and a payload. After the GSS-API handshake,
//! payloads are encrypted with `gss_wrap`, and the plaintext inside is a
//! *message*. Protocol version 1 messages are bare command and response
//! bodies; protocol version 2 messages carry a two byte
//! `version || type` header followed by a typed body.
//!
//! This crate has no I/O. It defines the flag and limit constants, the
//! message enum with its encoder and decoder, the packed argv format
//! shared by both protocol versions, and the reassembly state machine
//! for fragmented v2 commands. Socket handling and GSS-API wrapping
//! live in libremctl.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

/// Token flag bits.
///
/// `PROTOCOL` is the version negotiation bit: a peer that sets it on its
/// tokens speaks protocol version 2, and a peer that ever receives a
/// token without it must fall back to version 1 for the rest of the
/// connection.
pub mod flags {
    pub const NOOP: u8 = 1 << 0;
    pub const CONTEXT: u8 = 1 << 1;
    pub const DATA: u8 = 1 << 2;
    pub const MIC: u8 = 1 << 3;
    pub const CONTEXT_NEXT: u8 = 1 << 4;
    pub const SEND_MIC: u8 = 1 << 5;
    pub const PROTOCOL: u8 = 1 << 6;

    /// The first token sent by a v2-capable client.
    pub const INIT_V2: u8 = NOOP | CONTEXT_NEXT | PROTOCOL;
    /// The first token sent by a v1-only client.
    pub const INIT_V1: u8 = NOOP | CONTEXT_NEXT;
}

/// The highest protocol version fully supported by this implementation.
/// Version 3 exists only as the noop extension.
pub const PROTOCOL_VERSION: u8 = 2;

/// Largest token payload either side will accept on the wire, inclusive
/// of all GSS-API wrapping.
pub const TOKEN_MAX_LENGTH: usize = 1024 * 1024;

/// Nominal per-token data limit; the basis for the message and chunk
/// bounds below.
pub const TOKEN_MAX_DATA: usize = 64 * 1024;

/// Largest plaintext message allowed inside a protocol v2 token.
/// Anything bigger must be fragmented.
pub const MAX_MESSAGE: usize = TOKEN_MAX_DATA - 4;

/// Largest data chunk in a single v2 output message. The output header
/// is version, type, stream, and a four byte length.
pub const MAX_OUTPUT_DATA: usize = MAX_MESSAGE - 7;

/// Largest command fragment body in a single v2 command message, after
/// the version, type, keepalive, and continue bytes.
pub const MAX_COMMAND_DATA: usize = MAX_MESSAGE - 4;

/// Most arguments the server will accept in one command.
pub const MAX_ARGS: usize = 4 * 1024;

/// Cap on the total reassembled size of a fragmented command. Single
/// tokens are already bounded by [`TOKEN_MAX_LENGTH`], so reassembly
/// enforces the same bound.
pub const MAX_COMMAND_TOTAL: usize = TOKEN_MAX_LENGTH;

/// Protocol v2 message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Command = 1,
    Quit = 2,
    Output = 3,
    Status = 4,
    Error = 5,
    Version = 6,
    Noop = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(MessageType::Command),
            2 => Ok(MessageType::Quit),
            3 => Ok(MessageType::Output),
            4 => Ok(MessageType::Status),
            5 => Ok(MessageType::Error),
            6 => Ok(MessageType::Version),
            7 => Ok(MessageType::Noop),
            _ => Err(v),
        }
    }
}

/// Protocol error codes carried by v2 error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Internal = 1,
    BadToken = 2,
    UnknownMessage = 3,
    BadCommand = 4,
    UnknownCommand = 5,
    Access = 6,
    TooManyArgs = 7,
    TooMuchData = 8,
    UnexpectedMessage = 9,
    NoHelp = 10,
}

impl ErrorCode {
    /// The canonical human-readable message sent alongside this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Internal => "Internal failure",
            ErrorCode::BadToken => "Invalid token",
            ErrorCode::UnknownMessage => "Unknown message",
            ErrorCode::BadCommand => "Invalid command token",
            ErrorCode::UnknownCommand => "Unknown command",
            ErrorCode::Access => "Access denied",
            ErrorCode::TooManyArgs => "Too many arguments",
            ErrorCode::TooMuchData => "Too much data",
            ErrorCode::UnexpectedMessage => "Unexpected message",
            ErrorCode::NoHelp => "No help defined for this command",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (error {})", self.message(), *self as u32)
    }
}

/// Continuation status of a v2 command fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Continue {
    /// A complete command in a single token.
    Complete = 0,
    /// The first fragment of a multi-token command.
    First = 1,
    /// A middle fragment.
    Middle = 2,
    /// The final fragment.
    Last = 3,
}

impl TryFrom<u8> for Continue {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Continue::Complete),
            1 => Ok(Continue::First),
            2 => Ok(Continue::Middle),
            3 => Ok(Continue::Last),
            _ => Err(v),
        }
    }
}

/// A decoded protocol v2 message.
///
/// The `Command` body is kept as the raw fragment bytes rather than a
/// parsed argv, since fragments only become parseable once reassembled
/// by a [`CommandAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command { keepalive: bool, cont: Continue, body: Vec<u8> },
    Quit,
    Output { stream: u8, data: Vec<u8> },
    Status { status: u8 },
    Error { code: u32, message: Vec<u8> },
    Version { highest: u8 },
    Noop,
}

/// Why a v2 message payload failed to decode. The three cases demand
/// different responses from a server: an unknown version gets a version
/// message, an unknown type gets an unknown-message error, and a
/// malformed body gets a bad-token error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownVersion(u8),
    UnknownType(u8),
    Malformed(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownVersion(v) => write!(f, "unknown protocol version {v}"),
            DecodeError::UnknownType(t) => write!(f, "unknown message type {t}"),
            DecodeError::Malformed(what) => write!(f, "malformed message: {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Message {
    /// Serialize into a v2 token payload, including the version and
    /// type header. Noop messages carry version 3, everything else
    /// version 2.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Command { keepalive, cont, body } => {
                buf.reserve(4 + body.len());
                buf.push(2);
                buf.push(MessageType::Command as u8);
                buf.push(u8::from(*keepalive));
                buf.push(*cont as u8);
                buf.extend_from_slice(body);
            }
            Message::Quit => {
                buf.push(2);
                buf.push(MessageType::Quit as u8);
            }
            Message::Output { stream, data } => {
                buf.reserve(7 + data.len());
                buf.push(2);
                buf.push(MessageType::Output as u8);
                buf.push(*stream);
                buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
                buf.extend_from_slice(data);
            }
            Message::Status { status } => {
                buf.push(2);
                buf.push(MessageType::Status as u8);
                buf.push(*status);
            }
            Message::Error { code, message } => {
                buf.reserve(10 + message.len());
                buf.push(2);
                buf.push(MessageType::Error as u8);
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
                buf.extend_from_slice(message);
            }
            Message::Version { highest } => {
                buf.push(2);
                buf.push(MessageType::Version as u8);
                buf.push(*highest);
            }
            Message::Noop => {
                buf.push(3);
                buf.push(MessageType::Noop as u8);
            }
        }
        buf
    }

    /// Parse a v2 token payload.
    pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
        if payload.len() < 2 {
            return Err(DecodeError::Malformed("short header"));
        }
        let version = payload[0];
        let type_byte = payload[1];
        // The noop extension is the only version 3 message; any other
        // unknown version is answered with a version message.
        if version == 3 && type_byte == MessageType::Noop as u8 {
            return Ok(Message::Noop);
        }
        if version != 2 {
            return Err(DecodeError::UnknownVersion(version));
        }
        let body = &payload[2..];
        let msg_type = MessageType::try_from(type_byte).map_err(DecodeError::UnknownType)?;
        match msg_type {
            MessageType::Command => {
                if body.len() < 2 {
                    return Err(DecodeError::Malformed("short command header"));
                }
                let cont = Continue::try_from(body[1])
                    .map_err(|_| DecodeError::Malformed("bad continue status"))?;
                Ok(Message::Command {
                    keepalive: body[0] != 0,
                    cont,
                    body: body[2..].to_vec(),
                })
            }
            MessageType::Quit => Ok(Message::Quit),
            MessageType::Output => {
                if body.len() < 5 {
                    return Err(DecodeError::Malformed("short output header"));
                }
                let stream = body[0];
                if stream != 1 && stream != 2 {
                    return Err(DecodeError::Malformed("bad output stream"));
                }
                let len = BigEndian::read_u32(&body[1..5]) as usize;
                if len != body.len() - 5 {
                    return Err(DecodeError::Malformed("output length mismatch"));
                }
                Ok(Message::Output { stream, data: body[5..].to_vec() })
            }
            MessageType::Status => {
                if body.is_empty() {
                    return Err(DecodeError::Malformed("missing exit status"));
                }
                Ok(Message::Status { status: body[0] })
            }
            MessageType::Error => {
                if body.len() < 8 {
                    return Err(DecodeError::Malformed("short error header"));
                }
                let code = BigEndian::read_u32(&body[0..4]);
                let len = BigEndian::read_u32(&body[4..8]) as usize;
                if len != body.len() - 8 {
                    return Err(DecodeError::Malformed("error length mismatch"));
                }
                Ok(Message::Error { code, message: body[8..].to_vec() })
            }
            MessageType::Version => {
                if body.is_empty() {
                    return Err(DecodeError::Malformed("missing version"));
                }
                Ok(Message::Version { highest: body[0] })
            }
            MessageType::Noop => Err(DecodeError::Malformed("noop must be version 3")),
        }
    }
}

/// Pack an argument vector into the shared command body format:
/// a four byte count followed by a four byte length and the raw bytes
/// of each argument. This is the whole v1 command payload and the
/// reassembled logical body of a v2 command.
pub fn encode_args<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let total: usize = 4 + args.iter().map(|a| 4 + a.as_ref().len()).sum::<usize>();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(args.len() as u32).to_be_bytes());
    for arg in args {
        let arg = arg.as_ref();
        buf.extend_from_slice(&(arg.len() as u32).to_be_bytes());
        buf.extend_from_slice(arg);
    }
    buf
}

/// Why a packed argument vector failed to parse, mapped by the server
/// to the corresponding protocol error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    /// Zero arguments, or more than the limit.
    BadCount(usize),
    /// Lengths did not add up to the payload.
    Malformed,
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::BadCount(n) => write!(f, "invalid argument count {n}"),
            ArgsError::Malformed => write!(f, "malformed command data"),
        }
    }
}

impl std::error::Error for ArgsError {}

/// Unpack a command body into its argument vector.
pub fn decode_args(buf: &[u8], max_args: usize) -> Result<Vec<Vec<u8>>, ArgsError> {
    if buf.len() < 4 {
        return Err(ArgsError::Malformed);
    }
    let argc = BigEndian::read_u32(&buf[0..4]) as usize;
    if argc == 0 || argc > max_args {
        return Err(ArgsError::BadCount(argc));
    }
    let mut args = Vec::with_capacity(argc);
    let mut rest = &buf[4..];
    for _ in 0..argc {
        if rest.len() < 4 {
            return Err(ArgsError::Malformed);
        }
        let len = BigEndian::read_u32(&rest[0..4]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(ArgsError::Malformed);
        }
        args.push(rest[..len].to_vec());
        rest = &rest[len..];
    }
    if !rest.is_empty() {
        return Err(ArgsError::Malformed);
    }
    Ok(args)
}

/// Split a packed command body into the fragment sequence a v2 client
/// sends, each fragment small enough to fit in one token together with
/// the command message header.
pub fn split_command(body: &[u8]) -> Vec<(Continue, &[u8])> {
    if body.len() <= MAX_COMMAND_DATA {
        return vec![(Continue::Complete, body)];
    }
    let mut fragments = Vec::with_capacity(body.len() / MAX_COMMAND_DATA + 1);
    let mut rest = body;
    while rest.len() > MAX_COMMAND_DATA {
        let (chunk, tail) = rest.split_at(MAX_COMMAND_DATA);
        let cont = if fragments.is_empty() { Continue::First } else { Continue::Middle };
        fragments.push((cont, chunk));
        rest = tail;
    }
    fragments.push((Continue::Last, rest));
    fragments
}

/// Reassembles fragmented v2 commands.
///
/// Feed it every command message the server receives; it hands back the
/// complete packed body once the final fragment arrives and rejects
/// ill-ordered continuation sequences.
#[derive(Debug, Default)]
pub struct CommandAssembler {
    partial: Option<Vec<u8>>,
    keepalive: bool,
}

/// Reassembly failure. The offending command state is discarded by the
/// assembler before this is returned. The server maps the two cases to
/// different protocol error codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    /// Fragments arrived in an impossible order.
    IllOrdered(&'static str),
    /// The reassembled command exceeds [`MAX_COMMAND_TOTAL`].
    TooLarge,
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssembleError::IllOrdered(what) => write!(f, "{what}"),
            AssembleError::TooLarge => write!(f, "fragmented command too large"),
        }
    }
}

impl std::error::Error for AssembleError {}

impl CommandAssembler {
    pub fn new() -> Self {
        CommandAssembler::default()
    }

    /// True if a multi-token command is partway through reassembly.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Consume one command message. Returns the keepalive flag and the
    /// complete packed body once a command is whole, or `None` while
    /// more fragments are expected.
    pub fn push(
        &mut self,
        keepalive: bool,
        cont: Continue,
        body: &[u8],
    ) -> Result<Option<(bool, Vec<u8>)>, AssembleError> {
        match (cont, self.partial.take()) {
            (Continue::Complete, None) => Ok(Some((keepalive, body.to_vec()))),
            (Continue::Complete, Some(_)) => {
                Err(AssembleError::IllOrdered("complete command inside a fragmented one"))
            }
            (Continue::First, None) => {
                self.keepalive = keepalive;
                self.partial = Some(body.to_vec());
                Ok(None)
            }
            (Continue::First, Some(_)) => {
                Err(AssembleError::IllOrdered("first fragment inside a fragmented command"))
            }
            (Continue::Middle, Some(mut partial)) | (Continue::Last, Some(mut partial))
                if partial.len() + body.len() <= MAX_COMMAND_TOTAL =>
            {
                partial.extend_from_slice(body);
                if cont == Continue::Last {
                    Ok(Some((self.keepalive, partial)))
                } else {
                    self.partial = Some(partial);
                    Ok(None)
                }
            }
            (Continue::Middle, Some(_)) | (Continue::Last, Some(_)) => {
                Err(AssembleError::TooLarge)
            }
            (Continue::Middle, None) | (Continue::Last, None) => {
                Err(AssembleError::IllOrdered("continuation without a first fragment"))
            }
        }
    }
}

/// Encode the single v1 response token: exit status, output length, and
/// the merged output.
pub fn encode_v1_response(status: u32, output: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + output.len());
    buf.extend_from_slice(&status.to_be_bytes());
    buf.extend_from_slice(&(output.len() as u32).to_be_bytes());
    buf.extend_from_slice(output);
    buf
}

/// Decode a v1 response token into its status and output bytes.
pub fn decode_v1_response(buf: &[u8]) -> Result<(u32, Vec<u8>), DecodeError> {
    if buf.len() < 8 {
        return Err(DecodeError::Malformed("short v1 response"));
    }
    let status = BigEndian::read_u32(&buf[0..4]);
    let len = BigEndian::read_u32(&buf[4..8]) as usize;
    if len != buf.len() - 8 {
        return Err(DecodeError::Malformed("v1 response length mismatch"));
    }
    Ok((status, buf[8..].to_vec()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_round_trip() {
        let cases = vec![
            Message::Command {
                keepalive: true,
                cont: Continue::Complete,
                body: encode_args(&["test", "foo", "bar"]),
            },
            Message::Quit,
            Message::Output { stream: 1, data: b"hello world\n".to_vec() },
            Message::Output { stream: 2, data: vec![] },
            Message::Status { status: 0 },
            Message::Status { status: 255 },
            Message::Error {
                code: ErrorCode::Access as u32,
                message: b"Access denied".to_vec(),
            },
            Message::Version { highest: 2 },
            Message::Noop,
        ];

        for msg in cases {
            let encoded = msg.encode();
            let decoded = Message::decode(&encoded).expect("decode to succeed");
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn noop_is_version_3() {
        let encoded = Message::Noop.encode();
        assert_eq!(encoded, vec![3, 7]);
    }

    #[test]
    fn decode_errors() {
        // A future protocol version must be reported as such so the
        // server can answer with a version message.
        assert_eq!(
            Message::decode(&[4, 1, 0, 0]),
            Err(DecodeError::UnknownVersion(4))
        );
        // Version 3 is only valid for noop.
        assert_eq!(
            Message::decode(&[3, 1, 0, 0]),
            Err(DecodeError::UnknownVersion(3))
        );
        assert_eq!(Message::decode(&[2, 42]), Err(DecodeError::UnknownType(42)));
        assert!(matches!(Message::decode(&[2]), Err(DecodeError::Malformed(_))));
        // Output length field that disagrees with the payload.
        assert!(matches!(
            Message::decode(&[2, 3, 1, 0, 0, 0, 9, b'x']),
            Err(DecodeError::Malformed(_))
        ));
        // Stream tags other than stdout/stderr.
        assert!(matches!(
            Message::decode(&[2, 3, 3, 0, 0, 0, 1, b'x']),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn args_round_trip() {
        let cases: Vec<Vec<&[u8]>> = vec![
            vec![b"test", b"foo", b"hello world"],
            vec![b"t"],
            vec![b"test", b"", b"\x00\xff binary \x01"],
        ];
        for args in cases {
            let encoded = encode_args(&args);
            let decoded = decode_args(&encoded, MAX_ARGS).expect("decode to succeed");
            assert_eq!(args, decoded.iter().map(|a| a.as_slice()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn args_errors() {
        assert_eq!(decode_args(&encode_args::<&[u8]>(&[]), MAX_ARGS), Err(ArgsError::BadCount(0)));
        assert_eq!(
            decode_args(&encode_args(&[b"a", b"b", b"c"]), 2),
            Err(ArgsError::BadCount(3))
        );

        // Truncated argument data.
        let mut buf = encode_args(&[b"hello"]);
        buf.truncate(buf.len() - 1);
        assert_eq!(decode_args(&buf, MAX_ARGS), Err(ArgsError::Malformed));

        // Trailing junk after the declared arguments.
        let mut buf = encode_args(&[b"hello"]);
        buf.push(0);
        assert_eq!(decode_args(&buf, MAX_ARGS), Err(ArgsError::Malformed));
    }

    #[test]
    fn split_and_reassemble() {
        // One argument big enough to need four fragments.
        let big = vec![b'x'; 200_000];
        let body = encode_args(&[b"type".as_slice(), b"service", &big]);
        let fragments = split_command(&body);
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[0].0, Continue::First);
        assert_eq!(fragments[1].0, Continue::Middle);
        assert_eq!(fragments[2].0, Continue::Middle);
        assert_eq!(fragments[3].0, Continue::Last);
        for (_, chunk) in &fragments {
            assert!(chunk.len() <= MAX_COMMAND_DATA);
        }

        let mut assembler = CommandAssembler::new();
        let mut result = None;
        for (cont, chunk) in fragments {
            result = assembler.push(true, cont, chunk).expect("push to succeed");
        }
        let (keepalive, reassembled) = result.expect("command to complete");
        assert!(keepalive);
        assert_eq!(reassembled, body);

        let args = decode_args(&reassembled, MAX_ARGS).expect("decode to succeed");
        assert_eq!(args[2].len(), 200_000);
    }

    #[test]
    fn reassemble_arbitrary_boundaries() {
        // Splitting the serialized command at any boundary must yield
        // the same argv after reassembly.
        let body = encode_args(&[b"test".as_slice(), b"foo", b"some argument data"]);
        for split_at in [1, 4, 5, 9, body.len() - 1] {
            let mut assembler = CommandAssembler::new();
            let first = assembler
                .push(false, Continue::First, &body[..split_at])
                .expect("first fragment");
            assert!(first.is_none());
            let (_, reassembled) = assembler
                .push(false, Continue::Last, &body[split_at..])
                .expect("last fragment")
                .expect("command to complete");
            assert_eq!(reassembled, body);
        }
    }

    #[test]
    fn reassemble_rejects_ill_ordered() {
        let mut assembler = CommandAssembler::new();
        assert!(assembler.push(false, Continue::Middle, b"x").is_err());

        let mut assembler = CommandAssembler::new();
        assembler.push(false, Continue::First, b"x").expect("first fragment");
        assert!(assembler.push(false, Continue::First, b"y").is_err());
        // The error resets the assembler.
        assert!(!assembler.in_progress());

        let mut assembler = CommandAssembler::new();
        assembler.push(false, Continue::First, b"x").expect("first fragment");
        assert!(assembler.push(false, Continue::Complete, b"y").is_err());
    }

    #[test]
    fn v1_response_round_trip() {
        let encoded = encode_v1_response(0, b"ok\n");
        let (status, output) = decode_v1_response(&encoded).expect("decode to succeed");
        assert_eq!(status, 0);
        assert_eq!(output, b"ok\n");

        assert!(decode_v1_response(&encoded[..7]).is_err());
    }
}

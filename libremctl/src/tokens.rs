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

//! The token codec: the length-prefixed framing unit underneath every
//! remctl exchange. A token on the wire is one byte of flags, a four
//! byte big-endian payload length, and the payload.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    time::{Duration, Instant},
};

use byteorder::{BigEndian, ByteOrder};

use crate::consts;

/// How a token operation failed. Callers care about the distinctions:
/// a clean EOF before any byte means the peer closed politely, a short
/// header means it did not, and an oversized frame is rejected before
/// any allocation happens.
#[derive(Debug)]
pub enum TokenError {
    /// An I/O error from the underlying stream.
    System(io::Error),
    /// The whole-operation deadline expired.
    Timeout,
    /// The peer closed the stream before sending anything.
    Eof,
    /// The peer closed the stream mid-token or sent a short header.
    Invalid(&'static str),
    /// The declared payload length exceeds what we accept.
    Large { length: usize, max: usize },
    /// GSS-API wrap or unwrap failed. Fatal to the session.
    GssApi(String),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::System(e) => write!(f, "system error: {e}"),
            TokenError::Timeout => write!(f, "operation timed out"),
            TokenError::Eof => write!(f, "unexpected end of file"),
            TokenError::Invalid(what) => write!(f, "invalid token: {what}"),
            TokenError::Large { length, max } => {
                write!(f, "token length {length} exceeds limit {max}")
            }
            TokenError::GssApi(e) => write!(f, "GSS-API error: {e}"),
        }
    }
}

impl std::error::Error for TokenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenError::System(e) => Some(e),
            _ => None,
        }
    }
}

/// A whole-operation deadline shared by every read and write of one
/// logical token exchange. `None` means block indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn start(timeout: Option<Duration>) -> Deadline {
        Deadline(timeout.map(|t| Instant::now() + t))
    }

    pub fn none() -> Deadline {
        Deadline(None)
    }

    /// Time left before the deadline, or a timeout error once it has
    /// passed. The zero case matters: socket timeouts reject a zero
    /// duration, so an expired deadline must short-circuit here.
    pub fn remaining(&self) -> Result<Option<Duration>, TokenError> {
        match self.0 {
            None => Ok(None),
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(TokenError::Timeout)
                } else {
                    Ok(Some(left))
                }
            }
        }
    }
}

/// Write a whole buffer, retrying interrupted writes. Retries are
/// counted rather than timed so a peer feeding us zero-progress
/// results cannot livelock the connection.
fn write_full<W: Write + ?Sized>(w: &mut W, buf: &[u8]) -> Result<(), TokenError> {
    let mut written = 0;
    let mut tries = 0;
    while written < buf.len() {
        tries += 1;
        if tries > consts::MAX_IO_TRIES {
            return Err(TokenError::System(io::Error::new(
                io::ErrorKind::WriteZero,
                "no progress writing token",
            )));
        }
        match w.write(&buf[written..]) {
            Ok(0) => continue,
            Ok(n) => {
                written += n;
                tries = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(TokenError::Timeout)
            }
            Err(e) => return Err(TokenError::System(e)),
        }
    }
    Ok(())
}

/// Read up to `buf.len()` bytes, stopping early only on EOF. Returns
/// how many bytes were actually read.
fn read_full<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<usize, TokenError> {
    let mut filled = 0;
    let mut tries = 0;
    while filled < buf.len() {
        tries += 1;
        if tries > consts::MAX_IO_TRIES {
            return Err(TokenError::System(io::Error::new(
                io::ErrorKind::Other,
                "no progress reading token",
            )));
        }
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                tries = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(TokenError::Timeout)
            }
            Err(e) => return Err(TokenError::System(e)),
        }
    }
    Ok(filled)
}

/// Send one token: flags, length, payload, written as a single buffer.
pub fn send_token<W: Write + ?Sized>(
    w: &mut W,
    flags: u8,
    payload: &[u8],
) -> Result<(), TokenError> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(flags);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    write_full(w, &buf)
}

/// Receive one token, accepting at most `max` payload bytes. The limit
/// is checked against the declared length before the payload buffer is
/// allocated.
pub fn recv_token<R: Read + ?Sized>(r: &mut R, max: usize) -> Result<(u8, Vec<u8>), TokenError> {
    let mut header = [0u8; 5];
    let n = read_full(r, &mut header[..1])?;
    if n == 0 {
        return Err(TokenError::Eof);
    }
    let flags = header[0];

    let n = read_full(r, &mut header[1..5])?;
    if n < 4 {
        return Err(TokenError::Invalid("short length field"));
    }
    let length = BigEndian::read_u32(&header[1..5]) as usize;
    if length > max {
        return Err(TokenError::Large { length, max });
    }

    let mut payload = vec![0u8; length];
    let n = read_full(r, &mut payload)?;
    if n < length {
        return Err(TokenError::Invalid("short payload"));
    }
    Ok((flags, payload))
}

/// [`send_token`] against a TCP stream, bounded by a deadline. The
/// remaining time is installed as the socket write timeout before each
/// operation, so one stalled write cannot outlive the deadline.
pub fn send_token_timeout(
    stream: &TcpStream,
    flags: u8,
    payload: &[u8],
    deadline: &Deadline,
) -> Result<(), TokenError> {
    stream.set_write_timeout(deadline.remaining()?).map_err(TokenError::System)?;
    send_token(&mut &*stream, flags, payload)
}

/// [`recv_token`] against a TCP stream, bounded by a deadline.
pub fn recv_token_timeout(
    stream: &TcpStream,
    max: usize,
    deadline: &Deadline,
) -> Result<(u8, Vec<u8>), TokenError> {
    stream.set_read_timeout(deadline.remaining()?).map_err(TokenError::System)?;
    recv_token(&mut &*stream, max)
}

#[cfg(test)]
mod test {
    use std::{io::Cursor, net::TcpListener, thread, time};

    use ntest::timeout;

    use super::*;
    use remctl_protocol::flags;

    #[test]
    fn round_trip() {
        let cases: Vec<(u8, Vec<u8>)> = vec![
            (flags::NOOP | flags::CONTEXT_NEXT | flags::PROTOCOL, vec![]),
            (flags::CONTEXT, vec![1, 2, 3]),
            (flags::DATA | flags::PROTOCOL, vec![0; 70_000]),
        ];

        for (send_flags, payload) in cases {
            let mut buf = Vec::new();
            send_token(&mut buf, send_flags, &payload).expect("send to succeed");
            assert_eq!(buf.len(), 5 + payload.len());

            let mut cursor = Cursor::new(buf);
            let (recv_flags, recv_payload) =
                recv_token(&mut cursor, remctl_protocol::TOKEN_MAX_LENGTH)
                    .expect("recv to succeed");
            assert_eq!(send_flags, recv_flags);
            assert_eq!(payload, recv_payload);
        }
    }

    #[test]
    fn rejects_oversized_frames_before_reading_payload() {
        // A header declaring max + 1 bytes with no payload behind it.
        // If the length check happens where it should, we never notice
        // the missing payload.
        let mut buf = Vec::new();
        buf.push(flags::DATA);
        buf.extend_from_slice(&11u32.to_be_bytes());

        let mut cursor = Cursor::new(buf);
        match recv_token(&mut cursor, 10) {
            Err(TokenError::Large { length: 11, max: 10 }) => {}
            other => panic!("expected Large, got {other:?}"),
        }
    }

    #[test]
    fn eof_and_short_frames() {
        let empty: &[u8] = &[];
        assert!(matches!(recv_token(&mut Cursor::new(empty), 10), Err(TokenError::Eof)));

        // Flags but a truncated length field.
        let short: &[u8] = &[flags::DATA, 0, 0];
        assert!(matches!(
            recv_token(&mut Cursor::new(short), 10),
            Err(TokenError::Invalid(_))
        ));

        // Complete header, truncated payload.
        let mut buf = Vec::new();
        send_token(&mut buf, flags::DATA, b"hello").expect("send to succeed");
        buf.truncate(buf.len() - 2);
        assert!(matches!(
            recv_token(&mut Cursor::new(buf), 10),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    #[timeout(10000)]
    fn recv_deadline_expires() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = thread::spawn(move || {
            // Accept and then say nothing, leaving the client to wait.
            let (_conn, _) = listener.accept().expect("accept to succeed");
            thread::sleep(time::Duration::from_millis(500));
        });

        let stream = TcpStream::connect(addr)?;
        let deadline = Deadline::start(Some(time::Duration::from_millis(50)));
        match recv_token_timeout(&stream, 1024, &deadline) {
            Err(TokenError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }

        handle.join().expect("server thread");
        Ok(())
    }

    #[test]
    fn expired_deadline_short_circuits() {
        let deadline = Deadline::start(Some(time::Duration::from_millis(0)));
        assert!(matches!(deadline.remaining(), Err(TokenError::Timeout)));
        assert!(matches!(Deadline::none().remaining(), Ok(None)));
    }
}

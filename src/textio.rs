//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version  3 of the License, or  (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE. See  the GNU  General Public  License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

//! Line-level framing over the transport: bounded CRLF line reads and
//! formatted reply writes, with the optional wire-debugging tee.
//!
//! No command semantics live here; this layer only knows about lines and the
//! `250-`/`250 ` continuation convention.

use std::future::Future;
use std::io::{self, Write as _};
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufStream};

use crate::codes::EnhancedCode;
use crate::transport::ServerStream;

/// Commands longer than this are rejected without being parsed.
const MAX_LINE: usize = 1024;

/// Sink for the wire-debugging tee. Everything read from and written to the
/// transport is copied here when configured.
pub(crate) type DebugSink = Arc<Mutex<dyn io::Write + Send>>;

pub(crate) fn tee(debug: &Option<DebugSink>, bytes: &[u8]) {
    if let Some(ref sink) = *debug {
        let _ = sink.lock().unwrap().write_all(bytes);
    }
}

/// Runs `fut` under the given deadline, if any. Expiry surfaces as an
/// `io::ErrorKind::TimedOut` error.
pub(crate) async fn maybe_timeout<T>(
    deadline: Option<Duration>,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match deadline {
        None => fut.await,
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(r) => r,
            Err(_elapsed) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "deadline expired",
            )),
        },
    }
}

pub(crate) struct TextIo {
    pub(crate) io: BufStream<ServerStream>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) debug: Option<DebugSink>,
    /// Set when the previous line ended on a bare CR: an LF arriving at
    /// the start of the next read is the tail of a split CRLF, not an
    /// empty line.
    skip_leading_lf: bool,
}

impl TextIo {
    pub(crate) fn new(
        stream: ServerStream,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        debug: Option<DebugSink>,
    ) -> Self {
        TextIo {
            io: BufStream::new(stream),
            read_timeout,
            write_timeout,
            debug,
            skip_leading_lf: false,
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.io.get_ref().is_tls()
    }

    pub(crate) fn tls_string(&self) -> Option<String> {
        self.io.get_ref().tls_string()
    }

    /// Reads one command line, stripping the terminator: CRLF, a bare LF,
    /// or tolerantly a bare CR.
    ///
    /// Errors: `UnexpectedEof` when the peer hung up, `TimedOut` when the
    /// read deadline expired, `InvalidData` when the line exceeded
    /// `MAX_LINE` (the rest of the oversized line has been consumed, so the
    /// conversation may continue).
    pub(crate) async fn read_line(&mut self) -> io::Result<String> {
        let mut buffer = Vec::new();
        let complete = read_until_line_end(
            &mut self.io,
            &mut buffer,
            self.read_timeout,
            &mut self.skip_leading_lf,
        )
        .await?;

        if buffer.is_empty() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        tee(&self.debug, &buffer);

        if !complete {
            if buffer.len() < MAX_LINE {
                // EOF in the middle of a command
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            // Oversized line; skip the rest of it so the next read starts at
            // a command boundary.
            loop {
                buffer.clear();
                let complete = read_until_line_end(
                    &mut self.io,
                    &mut buffer,
                    self.read_timeout,
                    &mut self.skip_leading_lf,
                )
                .await?;
                if buffer.is_empty() {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                if complete {
                    break;
                }
            }

            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Line too long",
            ));
        }

        strip_line_ending(&mut buffer);
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Writes a reply, one element of `text` per line.
    ///
    /// All lines but the last use the `code-` continuation form; the last
    /// line carries the resolved enhanced code, if any.
    pub(crate) async fn write_reply(
        &mut self,
        code: u16,
        enhanced: EnhancedCode,
        text: &[&str],
    ) -> io::Result<()> {
        let s = format_reply(code, enhanced, text);
        tee(&self.debug, s.as_bytes());

        let io = &mut self.io;
        maybe_timeout(self.write_timeout, async move {
            io.write_all(s.as_bytes()).await?;
            io.flush().await
        })
        .await
    }

    /// Swaps the cleartext transport for a TLS one.
    ///
    /// Any bytes the client pipelined past STARTTLS are discarded along with
    /// the old buffers (RFC 3207 forbids pipelining across the handshake).
    /// If the handshake fails, the transport is left closed.
    pub(crate) async fn upgrade_tls(
        &mut self,
        config: &Arc<rustls::ServerConfig>,
    ) -> io::Result<()> {
        let stream =
            mem::replace(&mut self.io, BufStream::new(ServerStream::Closed))
                .into_inner();
        let tls = stream.accept_tls(config).await?;
        self.io = BufStream::new(tls);
        Ok(())
    }
}

/// Accumulates bytes from `src` into `buffer` until a line ending arrives
/// or `MAX_LINE` bytes are buffered without one.
///
/// A line ends at CRLF, at a bare LF, or tolerantly at a bare CR; the
/// terminator bytes are included in `buffer`. When the CR is the last byte
/// in view, waiting to see whether an LF follows would block on input the
/// client may never send, so the CR terminates the line by itself and
/// `skip_leading_lf` arranges for a split-off LF to be absorbed by the
/// next read instead of surfacing as an empty line.
///
/// Returns whether a line ending was seen: `false` means EOF or the size
/// bound, which the caller tells apart by `buffer.len()`.
async fn read_until_line_end<R: AsyncBufRead + Unpin>(
    src: &mut R,
    buffer: &mut Vec<u8>,
    read_timeout: Option<Duration>,
    skip_leading_lf: &mut bool,
) -> io::Result<bool> {
    loop {
        let chunk = maybe_timeout(read_timeout, src.fill_buf()).await?;
        if chunk.is_empty() {
            return Ok(false);
        }

        if mem::take(skip_leading_lf) && b'\n' == chunk[0] {
            src.consume(1);
            continue;
        }

        let space = MAX_LINE - buffer.len();
        let chunk = &chunk[..chunk.len().min(space)];

        match memchr::memchr2(b'\r', b'\n', chunk) {
            Some(eol) if b'\n' == chunk[eol] => {
                buffer.extend_from_slice(&chunk[..=eol]);
                src.consume(eol + 1);
                return Ok(true);
            },
            Some(eol) if eol + 1 < chunk.len() => {
                // CR with its successor in view: CRLF, or a bare CR
                // terminator.
                let end = if b'\n' == chunk[eol + 1] {
                    eol + 2
                } else {
                    eol + 1
                };
                buffer.extend_from_slice(&chunk[..end]);
                src.consume(end);
                return Ok(true);
            },
            Some(eol) => {
                // CR at the edge of the buffered input
                buffer.extend_from_slice(&chunk[..=eol]);
                src.consume(eol + 1);
                *skip_leading_lf = true;
                return Ok(true);
            },
            None => {
                let len = chunk.len();
                buffer.extend_from_slice(chunk);
                src.consume(len);
                if buffer.len() >= MAX_LINE {
                    return Ok(false);
                }
            },
        }
    }
}

fn strip_line_ending(buffer: &mut Vec<u8>) {
    if Some(&b'\n') == buffer.last() {
        let _ = buffer.pop();
        if Some(&b'\r') == buffer.last() {
            let _ = buffer.pop();
        }
    } else if Some(&b'\r') == buffer.last() {
        let _ = buffer.pop();
    }
}

fn format_reply(code: u16, enhanced: EnhancedCode, text: &[&str]) -> String {
    use std::fmt::Write as _;

    let mut s = String::new();
    for (ix, line) in text.iter().enumerate() {
        if ix + 1 < text.len() {
            let _ = write!(s, "{}-{}\r\n", code, line);
        } else {
            match enhanced.resolve(code) {
                Some((a, b, c)) => {
                    let _ =
                        write!(s, "{} {}.{}.{} {}\r\n", code, a, b, c, line);
                },
                None => {
                    let _ = write!(s, "{} {}\r\n", code, line);
                },
            }
        }
    }

    s
}

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

//! Streaming transfer of the DATA payload.
//!
//! The wire side is RFC 5321 §4.5.2: CRLF-delimited lines, a line of just
//! `.` ends the message, and a line starting with `.` loses that dot. The
//! session side is a [`DataStream`], fed through a bounded in-memory pipe so
//! the message is never buffered in full.
//!
//! Unlike the classic dot reader, the decoded payload keeps its CRLFs
//! exactly as sent; downstream consumers (DKIM verification in particular)
//! need the original bytes.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::task;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt,
    DuplexStream, ReadBuf,
};

use crate::textio::{maybe_timeout, tee, DebugSink};

/// How much decoded payload may sit in the pipe before the wire side stops
/// reading and waits for the session to catch up.
const PIPE_CAPACITY: usize = 4096;

/// Creates the pipe for one DATA transfer.
///
/// `max_message_bytes` of zero means unlimited.
pub(crate) fn pipe(max_message_bytes: u64) -> (DataStream, DataSink) {
    let (sink_end, stream_end) = tokio::io::duplex(PIPE_CAPACITY);
    let truncated = Arc::new(AtomicBool::new(false));
    let aborted = Arc::new(AtomicBool::new(false));

    (
        DataStream {
            inner: stream_end,
            truncated: Arc::clone(&truncated),
            aborted: Arc::clone(&aborted),
        },
        DataSink {
            writer: Some(sink_end),
            truncated,
            aborted,
            limit: max_message_bytes,
            produced: 0,
        },
    )
}

/// The message payload handed to [`Session::data`](crate::Session::data).
///
/// Reads produce the decoded message bytes. The stream is forward-only and
/// non-restartable; once the handler returns, the server consumes whatever
/// the client sent up to the terminating `.` line on its own, so the
/// handler is free to stop reading early.
///
/// When the configured message size limit is exceeded the stream yields an
/// error after the last permitted byte.
pub struct DataStream {
    inner: DuplexStream,
    truncated: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled_before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(ctx, buf) {
            task::Poll::Ready(Ok(())) => {
                // An end-of-stream is only the end of the message if the
                // wire side neither cut the payload at the size limit nor
                // lost the connection mid-transfer.
                if buf.filled().len() == filled_before
                    && this.truncated.load(SeqCst)
                {
                    task::Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::Other,
                        "maximum message size exceeded",
                    )))
                } else if buf.filled().len() == filled_before
                    && this.aborted.load(SeqCst)
                {
                    task::Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "message transfer aborted",
                    )))
                } else {
                    task::Poll::Ready(Ok(()))
                }
            },
            poll => poll,
        }
    }
}

/// The wire side of the pipe.
///
/// Dropping the sink signals end-of-message to the session. If the session
/// drops its end first, writes turn into silent discards so the wire can
/// still be consumed to the terminator.
pub(crate) struct DataSink {
    writer: Option<DuplexStream>,
    truncated: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    limit: u64,
    produced: u64,
}

impl DataSink {
    pub(crate) fn truncated(&self) -> bool {
        self.truncated.load(SeqCst)
    }

    /// Signals end-of-message to the session.
    fn finish(&mut self) {
        self.writer = None;
    }

    /// Signals a failed transfer: the session sees an error instead of a
    /// clean end-of-stream.
    fn abort(&mut self) {
        self.aborted.store(true, SeqCst);
        self.writer = None;
    }

    async fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let remaining = if self.limit > 0 {
            self.limit.saturating_sub(self.produced)
        } else {
            u64::MAX
        };
        self.produced = self.produced.saturating_add(data.len() as u64);

        if (data.len() as u64) > remaining {
            if let Some(ref mut writer) = self.writer {
                let _ = writer.write_all(&data[..remaining as usize]).await;
            }
            // Cut the session off at the limit. The flag is set before the
            // writer is dropped so the reader observes the error rather
            // than a clean EOF.
            self.truncated.store(true, SeqCst);
            self.writer = None;
            return;
        }

        if let Some(ref mut writer) = self.writer {
            if writer.write_all(data).await.is_err() {
                // The session dropped its stream; discard the rest.
                self.writer = None;
            }
        }
    }
}

/// Copies one message from `src` into `sink`, undoing dot stuffing and
/// consuming up to and including the terminating `.` line.
///
/// Line endings are handled strictly: only CRLF starts a new line, so bare
/// CRs and LFs inside the payload pass through untouched and binary content
/// survives exactly. The single exception is a `.` immediately followed by
/// LF at the start of a line, which cannot occur in conforming input and is
/// taken as the end of the message.
///
/// Errors mean the wire is no longer synchronized and the connection must
/// close; the session side of the pipe is failed so the handler cannot
/// mistake the partial payload for a complete message.
pub(crate) async fn copy_dot_stuffed<R: AsyncBufRead + Unpin>(
    src: &mut R,
    sink: &mut DataSink,
    read_timeout: Option<Duration>,
    debug: &Option<DebugSink>,
) -> io::Result<()> {
    match copy_to_terminator(src, sink, read_timeout, debug).await {
        Ok(()) => {
            sink.finish();
            Ok(())
        },
        Err(e) => {
            sink.abort();
            Err(e)
        },
    }
}

async fn copy_to_terminator<R: AsyncBufRead + Unpin>(
    src: &mut R,
    sink: &mut DataSink,
    read_timeout: Option<Duration>,
    debug: &Option<DebugSink>,
) -> io::Result<()> {
    // True at the beginning of the message and after each CRLF.
    let mut start_of_line = true;

    loop {
        let mut buffer = maybe_timeout(read_timeout, src.fill_buf()).await?;
        if buffer.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in message data",
            ));
        }

        if let Some(eol) = memchr::memchr(b'\n', buffer) {
            buffer = &buffer[..=eol];
        }
        let buffer_len = buffer.len();

        if start_of_line {
            if b".\r\n" == buffer || b".\n" == buffer {
                // End of message
                tee(debug, buffer);
                src.consume(buffer_len);
                break;
            }

            if b".\r" == buffer {
                // Maybe the end of the message, if a \n comes next.
                tee(debug, buffer);
                src.consume(buffer_len);

                let mut extra = [0u8; 1];
                maybe_timeout(read_timeout, src.read_exact(&mut extra))
                    .await?;
                tee(debug, &extra);
                if b'\n' == extra[0] {
                    break;
                }

                // Not the terminator; the leading dot was stuffing.
                sink.write(b"\r").await;
                sink.write(&extra).await;
                start_of_line = false;
                continue;
            }

            if b"." == buffer {
                // End of message or a stuffed dot; need two more bytes to
                // tell.
                tee(debug, buffer);
                src.consume(buffer_len);

                let mut extra = [0u8; 2];
                maybe_timeout(read_timeout, src.read_exact(&mut extra[..1]))
                    .await?;
                tee(debug, &extra[..1]);
                if b'\n' == extra[0] {
                    break;
                }

                maybe_timeout(read_timeout, src.read_exact(&mut extra[1..]))
                    .await?;
                tee(debug, &extra[1..]);
                if b"\r\n" == &extra {
                    break;
                }

                // extra[0] is not '\n', so no line ending was consumed and
                // the next read is mid-line.
                sink.write(&extra).await;
                start_of_line = false;
                continue;
            }
        }

        // Everything in the buffer is content, except a stuffed leading
        // dot.
        let line_contents = if start_of_line && b'.' == buffer[0] {
            &buffer[1..]
        } else {
            buffer
        };
        sink.write(line_contents).await;
        tee(debug, buffer);

        start_of_line = buffer.ends_with(b"\r\n");
        src.consume(buffer_len);
    }

    Ok(())
}

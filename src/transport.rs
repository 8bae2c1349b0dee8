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

//! The connection transport: a TCP or UNIX socket, optionally wrapped in
//! TLS, which can be upgraded from cleartext to TLS mid-conversation
//! (STARTTLS).

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Facts about a connection, as seen by backends and SASL mechanisms.
#[derive(Clone, Debug, Default)]
pub struct ConnectionState {
    /// The host name the client gave in HELO/EHLO/LHLO; empty before the
    /// greeting has been accepted.
    pub hostname: String,
    /// The peer address as reported by the listener.
    pub remote_addr: String,
    /// A `version:cipher` description of the TLS session, or `None` on a
    /// cleartext connection.
    pub tls: Option<String>,
}

/// The raw accepted socket.
pub(crate) enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    pub(crate) fn peer_addr_string(&self) -> String {
        match *self {
            Socket::Tcp(ref s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown-socket".to_owned()),
            Socket::Unix(ref s) => s
                .peer_addr()
                .ok()
                .and_then(|a| {
                    a.as_pathname()
                        .map(|p| p.display().to_string())
                })
                .unwrap_or_else(|| "unix-socket".to_owned()),
        }
    }
}

/// The transport a connection converses over.
///
/// `Closed` is the placeholder left behind while a STARTTLS upgrade is in
/// flight; if the handshake fails the connection keeps that state and the
/// conversation ends.
pub(crate) enum ServerStream {
    Plain(Socket),
    Tls(Box<TlsStream<Socket>>),
    Closed,
}

impl ServerStream {
    pub(crate) fn is_tls(&self) -> bool {
        matches!(*self, ServerStream::Tls(_))
    }

    pub(crate) fn tls_string(&self) -> Option<String> {
        match *self {
            ServerStream::Plain(_) | ServerStream::Closed => None,
            ServerStream::Tls(ref stream) => {
                let (_, session) = stream.get_ref();
                Some(format!(
                    "{}:{}",
                    session
                        .protocol_version()
                        .map_or_else(|| "unknown".to_owned(), |v| {
                            format!("{:?}", v)
                        }),
                    session
                        .negotiated_cipher_suite()
                        .map_or_else(|| "NONE".to_owned(), |c| {
                            format!("{:?}", c.suite())
                        }),
                ))
            },
        }
    }

    /// Performs the server side of a TLS handshake over the cleartext
    /// socket.
    ///
    /// Only legal on a `Plain` stream; the connection layer rejects STARTTLS
    /// on an already-TLS transport before calling this.
    pub(crate) async fn accept_tls(
        self,
        config: &Arc<rustls::ServerConfig>,
    ) -> io::Result<ServerStream> {
        match self {
            ServerStream::Plain(socket) => {
                let acceptor = TlsAcceptor::from(Arc::clone(config));
                let stream = acceptor.accept(socket).await?;
                Ok(ServerStream::Tls(Box::new(stream)))
            },
            ServerStream::Tls(_) | ServerStream::Closed => {
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "TLS handshake on non-cleartext stream",
                ))
            },
        }
    }
}

macro_rules! delegate_socket {
    ($self:expr, $s:ident => $e:expr) => {
        match *$self.get_mut() {
            Socket::Tcp(ref mut $s) => $e,
            Socket::Unix(ref mut $s) => $e,
        }
    };
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        delegate_socket!(self, s => Pin::new(s).poll_read(ctx, buf))
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        delegate_socket!(self, s => Pin::new(s).poll_write(ctx, buf))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        delegate_socket!(self, s => Pin::new(s).poll_flush(ctx))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        delegate_socket!(self, s => Pin::new(s).poll_shutdown(ctx))
    }
}

macro_rules! delegate_stream {
    ($self:expr, $s:ident => $e:expr, $closed:expr) => {
        match *$self.get_mut() {
            ServerStream::Plain(ref mut $s) => $e,
            ServerStream::Tls(ref mut $s) => $e,
            ServerStream::Closed => $closed,
        }
    };
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        delegate_stream!(
            self, s => Pin::new(s).poll_read(ctx, buf),
            task::Poll::Ready(Ok(()))
        )
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        delegate_stream!(
            self, s => Pin::new(s).poll_write(ctx, buf),
            task::Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
        )
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        delegate_stream!(
            self, s => Pin::new(s).poll_flush(ctx),
            task::Poll::Ready(Ok(()))
        )
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        delegate_stream!(
            self, s => Pin::new(s).poll_shutdown(ctx),
            task::Poll::Ready(Ok(()))
        )
    }
}

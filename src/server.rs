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

//! The server: configuration, listeners, and the accept loop that spawns
//! one task per connection.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::conn::Conn;
use crate::sasl::{Mechanism, MechanismFactory, Plain};
use crate::textio::DebugSink;
use crate::transport::{ConnectionState, ServerStream, Socket};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Network {
    Tcp,
    Unix,
}

/// The frozen per-server configuration shared by all connections.
#[derive(Clone)]
pub(crate) struct Config {
    addr: String,
    network: Network,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) lmtp: bool,
    pub(crate) domain: String,
    pub(crate) max_recipients: usize,
    pub(crate) max_message_bytes: u64,
    pub(crate) allow_insecure_auth: bool,
    pub(crate) allow_xforward: bool,
    pub(crate) strict: bool,
    pub(crate) auth_disabled: bool,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    /// Capabilities advertised unconditionally in EHLO/LHLO replies.
    pub(crate) caps: Vec<String>,
    pub(crate) auths: BTreeMap<String, MechanismFactory>,
    pub(crate) debug: Option<DebugSink>,
}

/// An ESMTP/LMTP server.
///
/// Construct with a [`Backend`], adjust the configuration with the builder
/// methods, then run one of the `listen_and_serve` variants or hand a
/// pre-bound [`Listener`] to [`serve`](Server::serve).
pub struct Server {
    config: Config,
    backend: Arc<dyn Backend>,
    conns: Arc<Mutex<HashMap<u64, Arc<ConnHandle>>>>,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(backend: impl Backend + 'static) -> Self {
        let mut auths = BTreeMap::<String, MechanismFactory>::new();
        auths.insert(
            "PLAIN".to_owned(),
            Arc::new(|_: &ConnectionState| {
                Box::new(Plain) as Box<dyn Mechanism>
            }),
        );

        Server {
            config: Config {
                addr: String::new(),
                network: Network::Tcp,
                tls: None,
                lmtp: false,
                domain: "localhost".to_owned(),
                max_recipients: 0,
                max_message_bytes: 0,
                allow_insecure_auth: false,
                allow_xforward: false,
                strict: false,
                auth_disabled: false,
                read_timeout: None,
                write_timeout: None,
                caps: vec![
                    "PIPELINING".to_owned(),
                    "8BITMIME".to_owned(),
                    "ENHANCEDSTATUSCODES".to_owned(),
                ],
                auths,
                debug: None,
            },
            backend: Arc::new(backend),
            conns: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// The address to listen on: `host:port`, or a filesystem path with
    /// [`unix_socket`](Server::unix_socket). Blank selects port 25 (465
    /// for the TLS listener).
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Listen on a UNIX socket instead of TCP.
    pub fn unix_socket(mut self) -> Self {
        self.config.network = Network::Unix;
        self
    }

    /// The service domain used in the greeting banner and EHLO replies.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = domain.into();
        self
    }

    /// Speak LMTP (RFC 2033): LHLO instead of HELO/EHLO, and one final
    /// DATA reply per accepted recipient.
    pub fn lmtp(mut self) -> Self {
        self.config.lmtp = true;
        self
    }

    /// Enables STARTTLS (and [`listen_and_serve_tls`]) with this
    /// configuration.
    ///
    /// [`listen_and_serve_tls`]: Server::listen_and_serve_tls
    pub fn tls_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.config.tls = Some(config);
        self
    }

    /// Maximum RCPT commands per transaction; 0 means unlimited.
    pub fn max_recipients(mut self, max: usize) -> Self {
        self.config.max_recipients = max;
        self
    }

    /// Maximum message payload size in bytes, advertised as `SIZE`;
    /// 0 means unlimited.
    pub fn max_message_bytes(mut self, max: u64) -> Self {
        self.config.max_message_bytes = max;
        self
    }

    /// Permits AUTH over cleartext connections.
    pub fn allow_insecure_auth(mut self) -> Self {
        self.config.allow_insecure_auth = true;
        self
    }

    /// Accepts XFORWARD from the peer. Enable only when every peer is a
    /// trusted relay.
    pub fn allow_xforward(mut self) -> Self {
        self.config.allow_xforward = true;
        self
    }

    /// Requires angle-bracketed addresses in MAIL and RCPT.
    pub fn strict(mut self) -> Self {
        self.config.strict = true;
        self
    }

    /// Stops advertising AUTH and rejects authentication attempts. This
    /// overrides [`allow_insecure_auth`](Server::allow_insecure_auth).
    pub fn disable_auth(mut self) -> Self {
        self.config.auth_disabled = true;
        self
    }

    /// Deadline applied to each read from the client.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Deadline applied to each reply write.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    /// Tees everything read from and written to clients into `writer`.
    pub fn debug_to_writer(
        mut self,
        writer: impl io::Write + Send + 'static,
    ) -> Self {
        self.config.debug = Some(Arc::new(Mutex::new(writer)));
        self
    }

    /// Registers (or replaces) a SASL mechanism.
    pub fn enable_auth(
        mut self,
        name: impl Into<String>,
        factory: MechanismFactory,
    ) -> Self {
        self.config.auths.insert(name.into().to_uppercase(), factory);
        self
    }

    /// Binds the configured address and serves until
    /// [`close`](Server::close) is called.
    pub async fn listen_and_serve(&self) -> io::Result<()> {
        let listener = match self.config.network {
            Network::Tcp => {
                let addr = if self.config.addr.is_empty() {
                    "0.0.0.0:25"
                } else {
                    self.config.addr.as_str()
                };
                Listener::Tcp(TcpListener::bind(addr).await?)
            },
            Network::Unix => {
                if self.config.addr.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "listen address required for a UNIX socket",
                    ));
                }
                Listener::Unix(UnixListener::bind(&self.config.addr)?)
            },
        };

        self.serve_inner(listener, false).await
    }

    /// Like [`listen_and_serve`](Server::listen_and_serve), but performs
    /// the TLS handshake immediately on accept (SMTPS).
    pub async fn listen_and_serve_tls(&self) -> io::Result<()> {
        if self.config.tls.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS configuration required",
            ));
        }

        let addr = if self.config.addr.is_empty() {
            "0.0.0.0:465"
        } else {
            self.config.addr.as_str()
        };
        let listener = Listener::Tcp(TcpListener::bind(addr).await?);
        self.serve_inner(listener, true).await
    }

    /// Serves connections accepted from `listener` until
    /// [`close`](Server::close) is called.
    pub async fn serve(&self, listener: Listener) -> io::Result<()> {
        self.serve_inner(listener, false).await
    }

    async fn serve_inner(
        &self,
        listener: Listener,
        implicit_tls: bool,
    ) -> io::Result<()> {
        let config = Arc::new(self.config.clone());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    self.spawn_conn(&config, accepted?, implicit_tls);
                },
            }
        }
    }

    fn spawn_conn(
        &self,
        config: &Arc<Config>,
        socket: Socket,
        implicit_tls: bool,
    ) {
        let id = self.next_conn_id.fetch_add(1, Relaxed);
        let handle = Arc::new(ConnHandle {
            remote_addr: socket.peer_addr_string(),
            tls: AtomicBool::new(false),
            shutdown: self.shutdown.child_token(),
        });
        self.conns.lock().unwrap().insert(id, Arc::clone(&handle));

        let config = Arc::clone(config);
        let backend = Arc::clone(&self.backend);
        let conns = Arc::clone(&self.conns);
        tokio::spawn(async move {
            let stream = if implicit_tls {
                // Checked in listen_and_serve_tls
                let tls_config = config.tls.clone().unwrap();
                match ServerStream::Plain(socket)
                    .accept_tls(&tls_config)
                    .await
                {
                    Ok(stream) => {
                        handle.set_tls();
                        stream
                    },
                    Err(e) => {
                        warn!(
                            "smtps:{} TLS accept failed: {}",
                            handle.remote_addr(),
                            e,
                        );
                        conns.lock().unwrap().remove(&id);
                        return;
                    },
                }
            } else {
                ServerStream::Plain(socket)
            };

            Conn::new(stream, config, backend, Arc::clone(&handle))
                .serve()
                .await;
            conns.lock().unwrap().remove(&id);
        });
    }

    /// Stops the accept loops and closes every open connection. Each
    /// connection's session is logged out as its task winds down.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Invokes `f` on each currently open connection.
    pub fn for_each_conn(&self, mut f: impl FnMut(&ConnHandle)) {
        for handle in self.conns.lock().unwrap().values() {
            f(handle);
        }
    }
}

/// A bound listener [`Server::serve`] accepts connections from.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> io::Result<Socket> {
        match *self {
            Listener::Tcp(ref listener) => {
                listener.accept().await.map(|(s, _)| Socket::Tcp(s))
            },
            Listener::Unix(ref listener) => {
                listener.accept().await.map(|(s, _)| Socket::Unix(s))
            },
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(listener: TcpListener) -> Self {
        Listener::Tcp(listener)
    }
}

impl From<UnixListener> for Listener {
    fn from(listener: UnixListener) -> Self {
        Listener::Unix(listener)
    }
}

/// The externally visible face of one open connection, as seen through
/// [`Server::for_each_conn`].
pub struct ConnHandle {
    remote_addr: String,
    tls: AtomicBool,
    shutdown: CancellationToken,
}

impl ConnHandle {
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.load(Relaxed)
    }

    /// Forces the connection closed. Its session is still logged out
    /// normally.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn set_tls(&self) {
        self.tls.store(true, Relaxed);
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

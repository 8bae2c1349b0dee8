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

//! Shared plumbing for the protocol-level integration tests: a synchronous
//! test client, a thread-hosted server, and a backend that records every
//! callback it receives.

use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;

use crate::{
    Backend, ConnectionState, DataContext, DataStream, EnhancedCode, Error,
    Listener, Server, Session, SmtpError, XForward,
};

lazy_static! {
    pub static ref SERVER_TLS_CONFIG: Arc<rustls::ServerConfig> = {
        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_owned(),
        ])
        .unwrap();
        let certs = vec![rustls::Certificate(cert.serialize_der().unwrap())];
        let key = rustls::PrivateKey(cert.serialize_private_key_der());

        Arc::new(
            rustls::ServerConfig::builder()
                .with_safe_defaults()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .unwrap(),
        )
    };
    static ref CLIENT_TLS_CONFIG: Arc<rustls::ClientConfig> = Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(
                NoCertificateVerification,
            ))
            .with_no_client_auth(),
    );
}

/// The tests talk to a throwaway self-signed certificate.
struct NoCertificateVerification;

impl rustls::client::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// A server running on its own thread (with its own single-threaded
/// runtime), reachable over localhost TCP.
pub struct TestServer {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
}

impl TestServer {
    pub fn start(server: Server) -> Self {
        crate::init_test_log();

        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let server = Arc::new(server);

        let server_clone = Arc::clone(&server);
        std::thread::spawn(move || run_server(server_clone, std_listener));

        TestServer { server, addr }
    }

    pub fn connect(&self, name: &'static str) -> SmtpClient {
        let stream = std::net::TcpStream::connect(self.addr).unwrap();
        SmtpClient::new(name, stream)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run_server(server: Arc<Server>, listener: std::net::TcpListener) {
    listener.set_nonblocking(true).unwrap();
    let listener = tokio::net::TcpListener::from_std(listener).unwrap();
    let _ = server.serve(Listener::from(listener)).await;
    // serve only returns on close(); give the connection tasks time to
    // observe the shutdown and log their sessions out before the runtime
    // drops them.
    tokio::time::sleep(Duration::from_secs(1)).await;
}

pub trait ReadWrite: Read + Write {}
impl<T: Read + Write + ?Sized> ReadWrite for T {}

pub struct SmtpClient {
    name: &'static str,
    io: Box<dyn ReadWrite>,
    buffer: Vec<u8>,
}

impl SmtpClient {
    pub fn new(name: &'static str, io: impl ReadWrite + 'static) -> Self {
        SmtpClient {
            name,
            io: Box::new(io),
            buffer: Vec::new(),
        }
    }

    /// Reads responses up to and including the final response line.
    pub fn read_responses(&mut self) -> Vec<String> {
        let mut ret = Vec::<String>::new();

        loop {
            let line = self.read_line_raw();
            println!("[{}] >> {:?}", self.name, line);

            if line.is_empty() {
                panic!("Unexpected EOF");
            }

            let last = " " == &line[3..4];
            ret.push(line);

            if last {
                break;
            }
        }

        ret
    }

    fn read_line_raw(&mut self) -> String {
        loop {
            if let Some(eol) =
                self.buffer.iter().position(|&b| b'\n' == b)
            {
                let line: Vec<u8> = self.buffer.drain(..=eol).collect();
                return String::from_utf8(line).unwrap();
            }

            let mut chunk = [0u8; 1024];
            let nread = self.io.read(&mut chunk).unwrap_or(0);
            if 0 == nread {
                return String::new();
            }
            self.buffer.extend_from_slice(&chunk[..nread]);
        }
    }

    /// Writes the given complete line (or lines) to the server.
    pub fn write_line(&mut self, s: &str) {
        assert!(s.ends_with('\n'));
        for line in s.split_inclusive('\n') {
            println!("[{}] << {:?}", self.name, line);
        }
        self.io.write_all(s.as_bytes()).unwrap();
        self.io.flush().unwrap();
    }

    /// Skips the server greeting, then sends the given greeting command
    /// and asserts it succeeds.
    pub fn skip_pleasantries(&mut self, cmd: &str) {
        self.read_responses();
        self.write_line(&format!("{}\r\n", cmd));
        let responses = self.read_responses();
        assert!(responses.last().unwrap().starts_with("250"));
    }

    /// Sends a command which is expected to have one response with the
    /// given prefix.
    pub fn simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{}\r\n", command));
        let responses = self.read_responses();
        assert_eq!(1, responses.len());
        assert!(
            responses[0].starts_with(prefix),
            "Expected {:?} to start with {:?}",
            responses[0],
            prefix,
        );
    }

    /// Performs the client side of a TLS handshake on the connection.
    pub fn start_tls(&mut self) {
        println!("[{}] <> Start TLS handshake", self.name);
        assert!(
            self.buffer.is_empty(),
            "Data pipelined across STARTTLS: {:?}",
            self.buffer,
        );

        let session = rustls::ClientConnection::new(
            Arc::clone(&CLIENT_TLS_CONFIG),
            rustls::ServerName::try_from("localhost").unwrap(),
        )
        .unwrap();

        let cxn = mem::replace(&mut self.io, Box::new(io::empty()));
        self.io = Box::new(rustls::StreamOwned::new(session, cxn));
        println!("[{}] <> TLS client ready", self.name);
    }

    /// Asserts that the server closes the connection without further data.
    pub fn expect_eof(&mut self) {
        let mut chunk = [0u8; 64];
        loop {
            match self.io.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => panic!(
                    "Expected EOF, read {:?}",
                    String::from_utf8_lossy(&chunk[..n]),
                ),
            }
        }
    }
}

/// Everything the recording backend observed, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    AnonymousLogin,
    Login(String, String),
    Mail(String),
    Rcpt(String),
    Data {
        body: Vec<u8>,
        helo: String,
        xforward: XForward,
    },
    Reset,
    Logout,
}

pub type Events = Arc<Mutex<Vec<Event>>>;

/// Waits for the asynchronous connection teardown to record an event
/// matching `predicate`.
pub fn await_event(
    events: &Events,
    predicate: impl Fn(&Event) -> bool,
) -> bool {
    for _ in 0..100 {
        if events.lock().unwrap().iter().any(&predicate) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    false
}

pub fn count_events(
    events: &Events,
    predicate: impl Fn(&Event) -> bool,
) -> usize {
    events.lock().unwrap().iter().filter(|e| predicate(e)).count()
}

/// Tweaks to the recording backend's behaviour, for driving the error
/// paths.
#[derive(Clone, Default)]
pub struct Behaviour {
    /// `anonymous_login` returns `Error::AuthRequired`.
    pub reject_anonymous: bool,
    /// The only username/password `login` accepts; `None` accepts
    /// anything.
    pub credentials: Option<(&'static str, &'static str)>,
    /// `rcpt` fails with the given reply for this recipient.
    pub rcpt_reject: Option<(&'static str, SmtpError)>,
    /// `mail` fails with this reply.
    pub mail_error: Option<SmtpError>,
    /// `mail` fails with a non-SMTP error.
    pub mail_fail_generic: bool,
    /// `data` fails with this reply after consuming the stream.
    pub data_error: Option<SmtpError>,
    /// `data` installs this custom success response.
    pub data_response: Option<SmtpError>,
    /// `mail` panics, for exercising the panic guard.
    pub panic_on_mail: bool,
}

pub struct RecordingBackend {
    events: Events,
    behaviour: Behaviour,
}

impl RecordingBackend {
    pub fn new() -> (Self, Events) {
        Self::with_behaviour(Behaviour::default())
    }

    pub fn with_behaviour(behaviour: Behaviour) -> (Self, Events) {
        let events = Events::default();
        (
            RecordingBackend {
                events: Arc::clone(&events),
                behaviour,
            },
            events,
        )
    }

    fn session(&self) -> Box<dyn Session> {
        Box::new(RecordingSession {
            events: Arc::clone(&self.events),
            behaviour: self.behaviour.clone(),
        })
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn login(
        &self,
        _state: &ConnectionState,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Session>, Error> {
        self.events.lock().unwrap().push(Event::Login(
            username.to_owned(),
            password.to_owned(),
        ));

        match self.behaviour.credentials {
            Some((user, pass)) if (user, pass) != (username, password) => {
                Err(Error::other("Bad credentials"))
            },
            _ => Ok(self.session()),
        }
    }

    async fn anonymous_login(
        &self,
        _state: &ConnectionState,
    ) -> Result<Box<dyn Session>, Error> {
        if self.behaviour.reject_anonymous {
            return Err(Error::AuthRequired);
        }

        self.events.lock().unwrap().push(Event::AnonymousLogin);
        Ok(self.session())
    }
}

struct RecordingSession {
    events: Events,
    behaviour: Behaviour,
}

#[async_trait]
impl Session for RecordingSession {
    async fn mail(&mut self, from: &str) -> Result<(), Error> {
        if self.behaviour.panic_on_mail {
            panic!("induced panic in mail handler");
        }

        self.events
            .lock()
            .unwrap()
            .push(Event::Mail(from.to_owned()));

        if let Some(ref e) = self.behaviour.mail_error {
            return Err(e.clone().into());
        }
        if self.behaviour.mail_fail_generic {
            return Err(Error::other("the dog ate it"));
        }

        Ok(())
    }

    async fn rcpt(&mut self, to: &str) -> Result<(), Error> {
        if let Some((rcpt, ref e)) = self.behaviour.rcpt_reject {
            if rcpt == to {
                return Err(e.clone().into());
            }
        }

        self.events.lock().unwrap().push(Event::Rcpt(to.to_owned()));
        Ok(())
    }

    async fn data(
        &mut self,
        mut stream: DataStream,
        ctx: Arc<DataContext>,
    ) -> Result<(), Error> {
        let mut body = Vec::new();
        let result =
            tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut body)
                .await;

        self.events.lock().unwrap().push(Event::Data {
            body,
            helo: ctx.helo().to_owned(),
            xforward: ctx.xforward(),
        });

        result?;

        if let Some(ref response) = self.behaviour.data_response {
            ctx.set_smtp_response(response.clone());
        }
        if let Some(ref e) = self.behaviour.data_error {
            return Err(e.clone().into());
        }

        Ok(())
    }

    async fn reset(&mut self) {
        self.events.lock().unwrap().push(Event::Reset);
    }

    async fn logout(&mut self) -> Result<(), Error> {
        self.events.lock().unwrap().push(Event::Logout);
        Ok(())
    }
}

/// A reply shaped like a host application would shape it.
pub fn custom_reply(
    code: u16,
    enhanced: (u8, u8, u8),
    message: &str,
) -> SmtpError {
    SmtpError::new(
        code,
        EnhancedCode::Set(enhanced.0, enhanced.1, enhanced.2),
        message,
    )
}

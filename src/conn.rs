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

//! The per-connection conversation: greeting, command dispatch, the mail
//! transaction state machine, AUTH, STARTTLS, and the DATA transfer with
//! its SMTP/LMTP outcome handling.
//!
//! The state machine is the flag set `(helo, from_received, recipients)`
//! rather than a named state enum; each handler checks the flags it needs
//! and answers with the appropriate 5xx when they are not satisfied.

use std::collections::HashSet;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use log::{error, info, warn};

use crate::backend::{Backend, Session};
use crate::codes::{EnhancedCode, SmtpError};
use crate::data;
use crate::delivery::{self, DataContext};
use crate::error::Error;
use crate::log_prefix::LogPrefix;
use crate::sasl::{SaslConn, Step};
use crate::server::{Config, ConnHandle};
use crate::syntax;
use crate::textio::TextIo;
use crate::transport::{ConnectionState, ServerStream};

/// The original client attributes a trusted upstream relay forwarded with
/// XFORWARD commands. Later commands overwrite earlier values per
/// attribute; a reset clears all of them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XForward {
    pub name: String,
    pub addr: String,
    pub proto: String,
    pub helo: String,
}

pub(crate) struct Conn {
    text: TextIo,
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    handle: Arc<ConnHandle>,
    log_prefix: LogPrefix,

    helo: String,
    session: Option<Box<dyn Session>>,
    xforward: XForward,
    from_received: bool,
    /// Accepted recipients, lowercased, in acceptance order.
    recipients: Vec<String>,
    recipient_set: HashSet<String>,
    nbr_errors: u32,
    quit: bool,
}

impl Conn {
    pub(crate) fn new(
        stream: ServerStream,
        config: Arc<Config>,
        backend: Arc<dyn Backend>,
        handle: Arc<ConnHandle>,
    ) -> Self {
        let log_prefix = LogPrefix::new(format!(
            "{}:{}",
            if config.lmtp { "lmtp" } else { "smtp" },
            handle.remote_addr(),
        ));
        let text = TextIo::new(
            stream,
            config.read_timeout,
            config.write_timeout,
            config.debug.clone(),
        );

        Conn {
            text,
            config,
            backend,
            handle,
            log_prefix,
            helo: String::new(),
            session: None,
            xforward: XForward::default(),
            from_received: false,
            recipients: Vec::new(),
            recipient_set: HashSet::new(),
            nbr_errors: 0,
            quit: false,
        }
    }

    /// Runs the conversation to completion, then logs the session out.
    pub(crate) async fn serve(mut self) {
        info!("{} Connection established", self.log_prefix);

        let shutdown = self.handle.shutdown_token();
        let finished = tokio::select! {
            _ = self.run() => true,
            _ = shutdown.cancelled() => false,
        };
        if !finished {
            info!(
                "{} Server closing, dropping connection",
                self.log_prefix,
            );
        }

        self.teardown().await;
        info!("{} Connection closed", self.log_prefix);
    }

    async fn run(&mut self) {
        if let Err(e) = self.greet().await {
            warn!("{} Unable to send greeting: {}", self.log_prefix, e);
            return;
        }

        while !self.quit {
            let line = match self.text.read_line().await {
                Ok(line) => line,
                Err(e) => match e.kind() {
                    io::ErrorKind::UnexpectedEof => break,
                    io::ErrorKind::TimedOut => {
                        let _ = self
                            .reply(
                                221,
                                EnhancedCode::Set(2, 4, 2),
                                "Idle timeout, bye bye",
                            )
                            .await;
                        break;
                    },
                    io::ErrorKind::InvalidData => {
                        // Oversized line; read_line already skipped to the
                        // next command boundary.
                        if self
                            .reply(
                                500,
                                EnhancedCode::Set(5, 5, 2),
                                "Line too long",
                            )
                            .await
                            .is_err()
                        {
                            break;
                        }
                        continue;
                    },
                    _ => {
                        warn!(
                            "{} Connection error: {}",
                            self.log_prefix, e,
                        );
                        let _ = self
                            .reply(
                                221,
                                EnhancedCode::Set(2, 4, 0),
                                "Connection error, sorry",
                            )
                            .await;
                        break;
                    },
                },
            };

            let (verb, arg) = match syntax::parse_command(&line) {
                Ok(parsed) => parsed,
                Err(()) => {
                    self.nbr_errors += 1;
                    if self
                        .reply(501, EnhancedCode::Set(5, 5, 2), "Bad command")
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                },
            };

            if let Err(e) = self.dispatch(&verb, &arg).await {
                warn!("{} Unable to write reply: {}", self.log_prefix, e);
                break;
            }
        }
    }

    /// Dispatches one command under the per-command panic guard.
    async fn dispatch(&mut self, verb: &str, arg: &str) -> io::Result<()> {
        match AssertUnwindSafe(self.dispatch_inner(verb, arg))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    "{} panic serving {}: {}",
                    self.log_prefix,
                    verb,
                    panic_message(&*panic),
                );
                let _ = self
                    .reply(
                        421,
                        EnhancedCode::Set(4, 0, 0),
                        "Internal server error",
                    )
                    .await;
                self.quit = true;
                Ok(())
            },
        }
    }

    async fn dispatch_inner(
        &mut self,
        verb: &str,
        arg: &str,
    ) -> io::Result<()> {
        match verb {
            "" => {
                self.reply(500, EnhancedCode::Set(5, 5, 2), "Speak up").await
            },
            // Recognized but deliberately unimplemented
            "SEND" | "SOML" | "SAML" | "EXPN" | "HELP" | "TURN" => {
                self.reply(
                    502,
                    EnhancedCode::Set(5, 5, 1),
                    &format!("{} command not implemented", verb),
                )
                .await
            },
            "HELO" | "EHLO" | "LHLO" => self.cmd_hello(verb, arg).await,
            "XFORWARD" => {
                if !self.config.allow_xforward {
                    self.unrecognized_command(verb).await
                } else {
                    self.cmd_xforward(arg).await
                }
            },
            "MAIL" => self.cmd_mail(arg).await,
            "RCPT" => self.cmd_rcpt(arg).await,
            "VRFY" => {
                self.reply(
                    252,
                    EnhancedCode::Set(2, 5, 0),
                    "Cannot VRFY user, but will accept message",
                )
                .await
            },
            "NOOP" => {
                self.reply(
                    250,
                    EnhancedCode::Set(2, 0, 0),
                    "I have successfully done nothing",
                )
                .await
            },
            "RSET" => {
                self.reset_envelope().await;
                self.reply(250, EnhancedCode::Set(2, 0, 0), "Session reset")
                    .await
            },
            "DATA" => self.cmd_data(arg).await,
            "QUIT" => {
                self.quit = true;
                self.reply(
                    221,
                    EnhancedCode::Set(2, 0, 0),
                    "Goodnight and good luck",
                )
                .await
            },
            "AUTH" => {
                if self.config.auth_disabled {
                    self.unrecognized_command(verb).await
                } else {
                    self.cmd_auth(arg).await
                }
            },
            "STARTTLS" => self.cmd_starttls().await,
            _ => self.unrecognized_command(verb).await,
        }
    }

    async fn unrecognized_command(&mut self, verb: &str) -> io::Result<()> {
        self.reply(
            500,
            EnhancedCode::Set(5, 5, 2),
            &format!("Syntax error, {} command unrecognized", verb),
        )
        .await?;

        self.nbr_errors += 1;
        if self.nbr_errors > 3 {
            warn!(
                "{} Closing connection after too many unrecognized commands",
                self.log_prefix,
            );
            self.reply(
                500,
                EnhancedCode::Set(5, 5, 2),
                "Too many unrecognized commands",
            )
            .await?;
            self.quit = true;
        }

        Ok(())
    }

    async fn cmd_hello(&mut self, verb: &str, arg: &str) -> io::Result<()> {
        let lmtp = "LHLO" == verb;
        if self.config.lmtp && !lmtp {
            return self
                .reply(
                    500,
                    EnhancedCode::Set(5, 5, 1),
                    "This is a LMTP server, use LHLO",
                )
                .await;
        }
        if !self.config.lmtp && lmtp {
            return self
                .reply(
                    500,
                    EnhancedCode::Set(5, 5, 1),
                    "This is not a LMTP server",
                )
                .await;
        }

        let Ok(domain) = syntax::parse_hello_argument(arg) else {
            return self
                .reply(
                    501,
                    EnhancedCode::Set(5, 5, 2),
                    &format!(
                        "Domain/address argument required for {}",
                        verb,
                    ),
                )
                .await;
        };

        self.helo = domain.clone();
        self.log_prefix.set_helo(domain.clone());
        info!("{} {}", self.log_prefix, verb);

        if "HELO" == verb {
            return self
                .reply(
                    250,
                    EnhancedCode::Set(2, 0, 0),
                    &format!("Hello {}", domain),
                )
                .await;
        }

        let mut caps = self.config.caps.clone();
        if self.config.tls.is_some() && !self.text.is_tls() {
            caps.push("STARTTLS".to_owned());
        }
        if self.auth_allowed() {
            let mut auth_cap = "AUTH".to_owned();
            for name in self.config.auths.keys() {
                auth_cap.push(' ');
                auth_cap.push_str(name);
            }
            caps.push(auth_cap);
        }
        if self.config.max_message_bytes > 0 {
            caps.push(format!("SIZE {}", self.config.max_message_bytes));
        }
        if self.config.allow_xforward {
            caps.push("XFORWARD NAME ADDR PROTO HELO".to_owned());
        }

        let first = format!("{} Hello {}", self.config.domain, domain);
        let mut lines = vec![first.as_str()];
        lines.extend(caps.iter().map(String::as_str));
        self.text.write_reply(250, EnhancedCode::None, &lines).await
    }

    async fn cmd_xforward(&mut self, arg: &str) -> io::Result<()> {
        let Ok(update) = syntax::parse_xforward(arg) else {
            return self
                .reply(
                    501,
                    EnhancedCode::Set(2, 5, 1),
                    "Bad command parameter syntax",
                )
                .await;
        };

        if let Some(name) = update.name {
            self.xforward.name = name;
        }
        if let Some(addr) = update.addr {
            self.xforward.addr = addr;
        }
        if let Some(proto) = update.proto {
            self.xforward.proto = proto;
        }
        if let Some(helo) = update.helo {
            self.xforward.helo = helo;
        }

        self.reply(250, EnhancedCode::Set(2, 0, 0), "Ok").await
    }

    async fn cmd_mail(&mut self, arg: &str) -> io::Result<()> {
        if self.helo.is_empty() {
            return self
                .reply(
                    502,
                    EnhancedCode::Set(2, 5, 1),
                    "Please introduce yourself first.",
                )
                .await;
        }

        if self.session.is_none() {
            let state = self.state();
            match self.backend.anonymous_login(&state).await {
                Ok(session) => self.session = Some(session),
                Err(Error::Smtp(ref smtp)) => {
                    return self.reply_smtp_error(smtp).await;
                },
                Err(Error::AuthRequired) => {
                    return self
                        .reply(
                            530,
                            EnhancedCode::Set(5, 7, 0),
                            "Authentication required",
                        )
                        .await;
                },
                Err(e) => {
                    return self
                        .reply(
                            502,
                            EnhancedCode::Set(5, 7, 0),
                            &e.to_string(),
                        )
                        .await;
                },
            }
        }

        let args = match syntax::parse_mail_args(arg, self.config.strict) {
            Ok(args) => args,
            Err(ref smtp) => return self.reply_smtp_error(smtp).await,
        };

        if let Some(size) = args.size {
            if self.config.max_message_bytes > 0
                && size > self.config.max_message_bytes
            {
                return self
                    .reply(
                        552,
                        EnhancedCode::Set(5, 3, 4),
                        "Max message size exceeded",
                    )
                    .await;
            }
        }

        match self.session.as_mut().unwrap().mail(&args.from).await {
            Ok(()) => {
                info!(
                    "{} Start mail transaction from <{}>",
                    self.log_prefix, args.from,
                );
                self.from_received = true;
                self.reply(
                    250,
                    EnhancedCode::Set(2, 0, 0),
                    &format!("Roger, accepting mail from <{}>", args.from),
                )
                .await
            },
            Err(e) => self.reply_session_error(e).await,
        }
    }

    async fn cmd_rcpt(&mut self, arg: &str) -> io::Result<()> {
        if !self.from_received {
            return self
                .reply(
                    502,
                    EnhancedCode::Set(5, 5, 1),
                    "Missing MAIL FROM command.",
                )
                .await;
        }

        let recipient =
            match syntax::parse_rcpt_args(arg, self.config.strict) {
                Ok(recipient) => recipient,
                Err(ref smtp) => return self.reply_smtp_error(smtp).await,
            };

        if self.config.max_recipients > 0
            && self.recipients.len() >= self.config.max_recipients
        {
            return self
                .reply(
                    552,
                    EnhancedCode::Set(5, 5, 3),
                    &format!(
                        "Maximum limit of {} recipients reached",
                        self.config.max_recipients,
                    ),
                )
                .await;
        }

        let key = recipient.to_lowercase();
        if self.config.lmtp && self.recipient_set.contains(&key) {
            return self
                .reply(
                    451,
                    EnhancedCode::Set(4, 0, 0),
                    &format!(
                        "Duplicate RCPT TO:<{}>. Please try again later.",
                        recipient,
                    ),
                )
                .await;
        }

        match self.session.as_mut().unwrap().rcpt(&recipient).await {
            Ok(()) => {
                self.recipients.push(key.clone());
                self.recipient_set.insert(key);
                self.reply(
                    250,
                    EnhancedCode::Set(2, 0, 0),
                    &format!("I'll make sure <{}> gets this", recipient),
                )
                .await
            },
            Err(e) => self.reply_session_error(e).await,
        }
    }

    async fn cmd_auth(&mut self, arg: &str) -> io::Result<()> {
        if self.helo.is_empty() {
            return self
                .reply(
                    502,
                    EnhancedCode::Set(2, 5, 1),
                    "Please introduce yourself first.",
                )
                .await;
        }
        if !self.auth_allowed() {
            warn!(
                "{} Rejected AUTH on insecure connection",
                self.log_prefix,
            );
            return self
                .reply(
                    502,
                    EnhancedCode::Set(5, 7, 0),
                    "TLS is required to use AUTH",
                )
                .await;
        }

        let mut parts = arg.split_whitespace();
        let Some(mechanism) = parts.next() else {
            return self
                .reply(502, EnhancedCode::Set(5, 5, 4), "Missing parameter")
                .await;
        };
        let mechanism = mechanism.to_ascii_uppercase();

        let initial = match parts.next() {
            None => None,
            Some(ir) => match base64::decode(ir) {
                Ok(ir) => Some(ir),
                Err(_) => {
                    return self
                        .reply(
                            454,
                            EnhancedCode::Set(4, 7, 0),
                            "Invalid base64 data",
                        )
                        .await;
                },
            },
        };

        let Some(factory) = self.config.auths.get(&mechanism).cloned()
        else {
            return self
                .reply(
                    504,
                    EnhancedCode::Set(5, 7, 4),
                    "Unsupported authentication mechanism",
                )
                .await;
        };

        let state = self.state();
        let mut mech = factory(&state);
        let mut response = initial;

        loop {
            let step = {
                let mut sasl_conn = SaslConn::new(
                    state.clone(),
                    self.backend.as_ref(),
                    &mut self.session,
                );
                mech.next(response.as_deref(), &mut sasl_conn).await
            };

            let challenge = match step {
                Err(Error::Smtp(ref smtp)) => {
                    return self.reply_smtp_error(smtp).await;
                },
                Err(e) => {
                    warn!(
                        "{} {} authentication failed: {}",
                        self.log_prefix, mechanism, e,
                    );
                    return self
                        .reply(
                            454,
                            EnhancedCode::Set(4, 7, 0),
                            &e.to_string(),
                        )
                        .await;
                },
                Ok(Step::Done) => break,
                Ok(Step::Challenge(challenge)) => challenge,
            };

            let encoded = if challenge.is_empty() {
                String::new()
            } else {
                base64::encode(&challenge)
            };
            self.text
                .write_reply(334, EnhancedCode::None, &[&encoded])
                .await?;

            let line = match self.text.read_line().await {
                Ok(line) => line,
                Err(e) => {
                    warn!(
                        "{} Client lost during AUTH exchange: {}",
                        self.log_prefix, e,
                    );
                    self.quit = true;
                    return Ok(());
                },
            };

            response = match base64::decode(line.trim()) {
                Ok(response) => Some(response),
                Err(_) => {
                    return self
                        .reply(
                            454,
                            EnhancedCode::Set(4, 7, 0),
                            "Invalid base64 data",
                        )
                        .await;
                },
            };
        }

        if self.session.is_some() {
            info!(
                "{} Authenticated via {}",
                self.log_prefix, mechanism,
            );
            self.reply(
                235,
                EnhancedCode::Set(2, 0, 0),
                "Authentication succeeded",
            )
            .await?;
        }

        Ok(())
    }

    async fn cmd_starttls(&mut self) -> io::Result<()> {
        if self.text.is_tls() {
            return self
                .reply(
                    502,
                    EnhancedCode::Set(5, 5, 1),
                    "Already running in TLS",
                )
                .await;
        }
        let Some(tls_config) = self.config.tls.clone() else {
            return self
                .reply(502, EnhancedCode::Set(5, 5, 1), "TLS not supported")
                .await;
        };

        self.reply(220, EnhancedCode::Set(2, 0, 0), "Ready to start TLS")
            .await?;

        info!("{} Start TLS handshake", self.log_prefix);
        match self.text.upgrade_tls(&tls_config).await {
            Ok(()) => {
                info!("{} TLS handshake completed", self.log_prefix);
                self.handle.set_tls();
                // The envelope does not survive the security change, and a
                // fresh EHLO is required.
                self.reset_envelope().await;
                self.helo.clear();
                Ok(())
            },
            Err(e) => {
                // The stream is unrecoverable after a failed handshake;
                // there is no way to deliver a reply the client could
                // parse.
                warn!("{} TLS handshake failed: {}", self.log_prefix, e);
                self.quit = true;
                Ok(())
            },
        }
    }

    async fn cmd_data(&mut self, arg: &str) -> io::Result<()> {
        if !arg.is_empty() {
            return self
                .reply(
                    501,
                    EnhancedCode::Set(5, 5, 4),
                    "DATA command should not have any arguments",
                )
                .await;
        }
        if !self.from_received || self.recipients.is_empty() {
            return self
                .reply(
                    502,
                    EnhancedCode::Set(5, 5, 1),
                    "Missing RCPT TO command.",
                )
                .await;
        }

        self.reply(
            354,
            EnhancedCode::Set(2, 0, 0),
            "Go ahead. End your data with <CR><LF>.<CR><LF>",
        )
        .await?;

        let ctx = Arc::new(DataContext::new(
            self.helo.clone(),
            self.xforward.clone(),
            self.log_prefix.clone(),
        ));
        let (stream, mut sink) = data::pipe(self.config.max_message_bytes);

        // The wire feed and the session handler run concurrently so the
        // message streams through without being buffered whole. The feed
        // always consumes through the terminating dot, even if the handler
        // bails early.
        let (copy_result, data_result) = {
            let Conn {
                ref mut text,
                ref mut session,
                ..
            } = *self;
            let TextIo {
                ref mut io,
                read_timeout,
                ref debug,
                ..
            } = *text;
            let session = session.as_mut().unwrap();

            tokio::join!(
                data::copy_dot_stuffed(io, &mut sink, read_timeout, debug),
                session.data(stream, Arc::clone(&ctx)),
            )
        };
        let truncated = sink.truncated();
        drop(sink);

        if let Err(e) = copy_result {
            // The wire is no longer synchronized with the command stream.
            match e.kind() {
                io::ErrorKind::TimedOut => {
                    let _ = self
                        .reply(
                            221,
                            EnhancedCode::Set(2, 4, 2),
                            "Idle timeout, bye bye",
                        )
                        .await;
                },
                io::ErrorKind::UnexpectedEof => (),
                _ => {
                    warn!(
                        "{} Connection error in DATA: {}",
                        self.log_prefix, e,
                    );
                    let _ = self
                        .reply(
                            221,
                            EnhancedCode::Set(2, 4, 0),
                            "Connection error, sorry",
                        )
                        .await;
                },
            }
            self.quit = true;
            return Ok(());
        }

        if self.config.lmtp {
            // One reply per recipient in acceptance order; the handler's
            // return value is not consulted in LMTP mode.
            let recipients = self.recipients.clone();
            for rcpt in recipients {
                let status = if truncated {
                    oversized_status()
                } else {
                    delivery::await_status(&ctx, &rcpt).await
                };
                if !status.is_success() {
                    warn!(
                        "{} Delivery to <{}> failed: {}",
                        self.log_prefix, rcpt, status,
                    );
                }
                self.text
                    .write_reply(
                        status.code,
                        status.enhanced_code,
                        &[&format!("<{}> {}", rcpt, status.message)],
                    )
                    .await?;
            }
        } else {
            let status = if truncated {
                oversized_status()
            } else {
                match data_result {
                    Ok(()) => ctx.take_smtp_response().unwrap_or_else(|| {
                        SmtpError::new(
                            250,
                            EnhancedCode::Set(2, 0, 0),
                            "OK: queued",
                        )
                    }),
                    Err(Error::Smtp(smtp)) => smtp,
                    Err(e) => SmtpError::new(
                        554,
                        EnhancedCode::Set(5, 0, 0),
                        format!(
                            "Error: transaction failed, blame it on the \
                             weather: {}",
                            e,
                        ),
                    ),
                }
            };
            self.reply_smtp_error(&status).await?;
        }

        self.reset_envelope().await;
        Ok(())
    }

    async fn greet(&mut self) -> io::Result<()> {
        self.reply(
            220,
            EnhancedCode::None,
            &format!("{} ESMTP Service Ready", self.config.domain),
        )
        .await
    }

    async fn reply(
        &mut self,
        code: u16,
        enhanced: EnhancedCode,
        text: &str,
    ) -> io::Result<()> {
        self.text.write_reply(code, enhanced, &[text]).await
    }

    async fn reply_smtp_error(&mut self, e: &SmtpError) -> io::Result<()> {
        self.text
            .write_reply(e.code, e.enhanced_code, &[&e.message])
            .await
    }

    /// Maps a `MAIL`/`RCPT` session failure: an `SmtpError` is surfaced
    /// verbatim, anything else becomes a transient 451.
    async fn reply_session_error(&mut self, e: Error) -> io::Result<()> {
        match e {
            Error::Smtp(ref smtp) => self.reply_smtp_error(smtp).await,
            e => {
                self.reply(451, EnhancedCode::Set(4, 0, 0), &e.to_string())
                    .await
            },
        }
    }

    fn auth_allowed(&self) -> bool {
        !self.config.auth_disabled
            && (self.text.is_tls() || self.config.allow_insecure_auth)
    }

    fn state(&self) -> ConnectionState {
        ConnectionState {
            hostname: self.helo.clone(),
            remote_addr: self.handle.remote_addr().to_owned(),
            tls: self.text.tls_string(),
        }
    }

    /// Clears the envelope: transaction flags, recipients, and forwarded
    /// client attributes. The greeting and any authenticated session
    /// survive.
    async fn reset_envelope(&mut self) {
        if let Some(ref mut session) = self.session {
            session.reset().await;
        }
        self.from_received = false;
        self.recipients.clear();
        self.recipient_set.clear();
        self.xforward = XForward::default();
    }

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout().await {
                warn!("{} Session logout failed: {}", self.log_prefix, e);
            }
        }
    }
}

fn oversized_status() -> SmtpError {
    SmtpError::new(
        552,
        EnhancedCode::Set(5, 3, 4),
        "Max message size exceeded",
    )
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

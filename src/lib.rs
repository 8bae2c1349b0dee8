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

//! An embeddable ESMTP (RFC 5321) / LMTP (RFC 2033) server.
//!
//! The host application provides a [`Backend`] which creates [`Session`]s;
//! the library owns the listeners, the per-connection protocol
//! conversation, streaming DATA transfer, SASL authentication (PLAIN out
//! of the box, others via [`Server::enable_auth`]), STARTTLS, and XFORWARD.
//! In LMTP mode the session reports one delivery status per recipient
//! through the [`DataContext`], from whichever tasks it chooses to spawn.
//!
//! Supported extensions: PIPELINING, 8BITMIME, ENHANCEDSTATUSCODES, AUTH,
//! SIZE, STARTTLS, XFORWARD.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use tokio::io::AsyncReadExt;
//!
//! use postern::*;
//!
//! struct Printer;
//! struct PrinterSession;
//!
//! #[async_trait]
//! impl Backend for Printer {
//!     async fn login(
//!         &self,
//!         _state: &ConnectionState,
//!         _username: &str,
//!         _password: &str,
//!     ) -> Result<Box<dyn Session>, Error> {
//!         Ok(Box::new(PrinterSession))
//!     }
//!
//!     async fn anonymous_login(
//!         &self,
//!         _state: &ConnectionState,
//!     ) -> Result<Box<dyn Session>, Error> {
//!         Ok(Box::new(PrinterSession))
//!     }
//! }
//!
//! #[async_trait]
//! impl Session for PrinterSession {
//!     async fn mail(&mut self, _from: &str) -> Result<(), Error> {
//!         Ok(())
//!     }
//!
//!     async fn rcpt(&mut self, _to: &str) -> Result<(), Error> {
//!         Ok(())
//!     }
//!
//!     async fn data(
//!         &mut self,
//!         mut stream: DataStream,
//!         _ctx: Arc<DataContext>,
//!     ) -> Result<(), Error> {
//!         let mut message = Vec::new();
//!         stream.read_to_end(&mut message).await?;
//!         println!("{}", String::from_utf8_lossy(&message));
//!         Ok(())
//!     }
//!
//!     async fn reset(&mut self) {}
//!
//!     async fn logout(&mut self) -> Result<(), Error> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> std::io::Result<()> {
//!     Server::new(Printer)
//!         .addr("127.0.0.1:1025")
//!         .domain("mx.example")
//!         .listen_and_serve()
//!         .await
//! }
//! ```

mod backend;
mod codes;
mod conn;
mod data;
mod delivery;
mod error;
mod log_prefix;
mod sasl;
mod server;
mod syntax;
mod textio;
mod transport;

#[cfg(test)]
mod integration_test_common;

pub use crate::backend::{Backend, Session};
pub use crate::codes::{EnhancedCode, SmtpError};
pub use crate::conn::XForward;
pub use crate::data::DataStream;
pub use crate::delivery::DataContext;
pub use crate::error::Error;
pub use crate::sasl::{Mechanism, MechanismFactory, Plain, SaslConn, Step};
pub use crate::server::{ConnHandle, Listener, Server};
pub use crate::transport::ConnectionState;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().is_some_and(|v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(
                log4rs::encode::pattern::PatternEncoder::new(
                    "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
                ),
            ))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        log4rs::init_config(log_config).unwrap();
    })
}

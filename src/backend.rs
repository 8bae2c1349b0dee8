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

//! The capability surface the server invokes on the host application.

use std::sync::Arc;

use async_trait::async_trait;

use crate::data::DataStream;
use crate::delivery::DataContext;
use crate::error::Error;
use crate::transport::ConnectionState;

/// Creates sessions for connections.
///
/// Errors of the [`Error::Smtp`] variant shape the reply sent to the client
/// directly; [`Error::AuthRequired`] from `anonymous_login` turns into
/// `530 5.7.0 Authentication required`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Authenticates a user. Return [`Error::AuthUnsupported`] if
    /// authentication is not available.
    async fn login(
        &self,
        state: &ConnectionState,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Session>, Error>;

    /// Called when the client attempts to send mail without logging in
    /// first. Return [`Error::AuthRequired`] to force authentication.
    async fn anonymous_login(
        &self,
        state: &ConnectionState,
    ) -> Result<Box<dyn Session>, Error>;
}

/// One connection's worth of mail-transaction state, owned by the host
/// application.
///
/// The server guarantees: at most one session per connection; `reset` is
/// invoked on RSET and after each completed DATA; `logout` is invoked
/// exactly once when the connection ends.
#[async_trait]
pub trait Session: Send {
    /// Sets the return path for the message being built.
    ///
    /// `from` is empty for the null return path (`MAIL FROM:<>`).
    async fn mail(&mut self, from: &str) -> Result<(), Error>;

    /// Adds a recipient to the message being built.
    async fn rcpt(&mut self, to: &str) -> Result<(), Error>;

    /// Receives the message contents.
    ///
    /// `stream` yields the decoded payload with original CRLFs preserved;
    /// it does not need to be read to completion. In LMTP mode the handler
    /// registers each recipient via
    /// [`DataContext::start_delivery`](crate::DataContext::start_delivery)
    /// and reports statuses through
    /// [`DataContext::set_status`](crate::DataContext::set_status), from
    /// this task or any other.
    async fn data(
        &mut self,
        stream: DataStream,
        ctx: Arc<DataContext>,
    ) -> Result<(), Error>;

    /// Discards the message currently being built.
    async fn reset(&mut self);

    /// Frees all resources associated with the session.
    async fn logout(&mut self) -> Result<(), Error>;
}

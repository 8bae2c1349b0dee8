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

//! Pluggable SASL server mechanisms.
//!
//! The AUTH handler looks the mechanism name up in the server's registry,
//! then drives the challenge/response loop: every [`Step::Challenge`] is
//! base64-encoded into a `334` reply and the client's next line is decoded
//! into the following `next` call. Mechanisms install the authenticated
//! session through the [`SaslConn`] handle; the registry ships with
//! `PLAIN` (RFC 4616) wired to [`Backend::login`](crate::Backend::login).

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{Backend, Session};
use crate::error::Error;
use crate::transport::ConnectionState;

/// One turn of a SASL exchange.
pub enum Step {
    /// Send this challenge (possibly empty) and wait for the client's
    /// response.
    Challenge(Vec<u8>),
    /// The exchange is complete.
    Done,
}

/// A server-side SASL mechanism instance, created per AUTH command.
#[async_trait]
pub trait Mechanism: Send {
    /// Advances the exchange.
    ///
    /// `response` is `None` when the client supplied no initial response;
    /// afterwards it is the decoded client response to the previous
    /// challenge. A successful exchange must install a session via
    /// [`SaslConn::set_session`] before returning [`Step::Done`].
    async fn next(
        &mut self,
        response: Option<&[u8]>,
        conn: &mut SaslConn<'_>,
    ) -> Result<Step, Error>;
}

/// Constructor for mechanism instances, registered per mechanism name via
/// [`Server::enable_auth`](crate::Server::enable_auth).
pub type MechanismFactory =
    Arc<dyn Fn(&ConnectionState) -> Box<dyn Mechanism> + Send + Sync>;

/// What a mechanism may do with the connection it is authenticating.
pub struct SaslConn<'a> {
    state: ConnectionState,
    backend: &'a dyn Backend,
    session: &'a mut Option<Box<dyn Session>>,
}

impl<'a> SaslConn<'a> {
    pub(crate) fn new(
        state: ConnectionState,
        backend: &'a dyn Backend,
        session: &'a mut Option<Box<dyn Session>>,
    ) -> Self {
        SaslConn {
            state,
            backend,
            session,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend
    }

    /// Installs the authenticated session on the connection.
    pub fn set_session(&mut self, session: Box<dyn Session>) {
        *self.session = Some(session);
    }
}

/// RFC 4616 PLAIN: a single `authorize\0authenticate\0password` response
/// checked against the backend.
pub struct Plain;

#[async_trait]
impl Mechanism for Plain {
    async fn next(
        &mut self,
        response: Option<&[u8]>,
        conn: &mut SaslConn<'_>,
    ) -> Result<Step, Error> {
        let Some(response) = response else {
            // No initial response; request one with an empty challenge.
            return Ok(Step::Challenge(Vec::new()));
        };

        let response = std::str::from_utf8(response)
            .map_err(|_| Error::other("Invalid PLAIN response"))?;

        let mut parts = response.split('\u{0}');
        let (Some(identity), Some(username), Some(password), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(Error::other("Invalid PLAIN response"));
        };

        if !identity.is_empty() && identity != username {
            return Err(Error::other("Identities not supported"));
        }

        let session = conn
            .backend()
            .login(conn.state(), username, password)
            .await?;
        conn.set_session(session);

        Ok(Step::Done)
    }
}

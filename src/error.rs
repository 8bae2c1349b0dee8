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

use std::io;

use thiserror::Error;

use crate::codes::SmtpError;

/// The error type session and backend callbacks return to the server core.
///
/// An `Smtp` variant is surfaced to the client verbatim. Everything else is
/// mapped to a generic reply appropriate to the failing command: `451` for
/// `MAIL`/`RCPT`, `554` for `DATA`, `454` for SASL mechanisms, and
/// `530`/`502` for login failures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Smtp(#[from] SmtpError),
    /// Returned by [`Backend::anonymous_login`](crate::Backend) when the
    /// backend does not accept unauthenticated mail.
    #[error("Please authenticate first")]
    AuthRequired,
    /// Returned by [`Backend::login`](crate::Backend) when the backend does
    /// not support authentication at all.
    #[error("Authentication not supported")]
    AuthUnsupported,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Convenience for host applications reporting a stringly-typed failure.
    pub fn other(message: impl Into<String>) -> Self {
        Error::Other(message.into().into())
    }
}

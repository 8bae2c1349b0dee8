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

//! The reply carrier: a basic RFC 5321 code plus an optional RFC 3463
//! enhanced status code.
//!
//! `SmtpError` doubles as the error type session callbacks use to shape the
//! reply sent to the client verbatim, which is why it is modelled as plain
//! numbers rather than closed enums: host applications are free to produce
//! any code the wire grammar permits.

use std::fmt;

/// RFC 3463 enhanced status code attached to a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnhancedCode {
    /// No explicit code. The reply writer derives `X.0.0` from the class of
    /// the basic code for 2xx/4xx/5xx replies and omits the enhanced code
    /// for everything else.
    Default,
    /// Suppress the enhanced code entirely (greeting banners, capability
    /// lists, SASL challenges).
    None,
    /// An explicit `class.subject.detail` triple.
    Set(u8, u8, u8),
}

impl EnhancedCode {
    /// Resolves the code actually emitted for a reply with the given basic
    /// code, or `None` if no enhanced code is emitted.
    pub(crate) fn resolve(self, code: u16) -> Option<(u8, u8, u8)> {
        match self {
            EnhancedCode::None => None,
            EnhancedCode::Set(a, b, c) => Some((a, b, c)),
            EnhancedCode::Default => match code / 100 {
                cat @ (2 | 4 | 5) => Some((cat as u8, 0, 0)),
                _ => None,
            },
        }
    }
}

/// A fully-shaped SMTP reply.
///
/// Returned as an error from [`Session`](crate::Session) and
/// [`Backend`](crate::Backend) callbacks to control the exact reply the
/// client sees, and delivered per recipient through
/// [`DataContext::set_status`](crate::DataContext::set_status) in LMTP mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmtpError {
    pub code: u16,
    pub enhanced_code: EnhancedCode,
    pub message: String,
}

impl SmtpError {
    pub fn new(
        code: u16,
        enhanced_code: EnhancedCode,
        message: impl Into<String>,
    ) -> Self {
        SmtpError {
            code,
            enhanced_code,
            message: message.into(),
        }
    }

    /// Whether this reply reports success (a 2xx code).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.enhanced_code.resolve(self.code) {
            Some((a, b, c)) => write!(
                f,
                "{} {}.{}.{} {}",
                self.code, a, b, c, self.message
            ),
            None => write!(f, "{} {}", self.code, self.message),
        }
    }
}

impl std::error::Error for SmtpError {}

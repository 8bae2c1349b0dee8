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

//! Command-line syntax: the verb/argument split, the MAIL/RCPT address
//! forms with their ESMTP parameters, the hello argument, and XFORWARD
//! attribute lists.
//!
//! Parsers return `SmtpError` values already shaped as the 501 replies the
//! dispatcher sends on failure.

use lazy_static::lazy_static;
use regex::Regex;

use crate::codes::{EnhancedCode, SmtpError};

lazy_static! {
    /// A host name or address literal, loosely: EHLO arguments are used for
    /// logging and the Received trace only, so this intentionally accepts
    /// anything bracket/dot/colon shaped rather than full RFC 5321 grammar.
    static ref RX_HELLO_DOMAIN: Regex =
        Regex::new(r"^[0-9A-Za-z._:\[\]-]+$").unwrap();
}

fn syntax_error(message: impl Into<String>) -> SmtpError {
    SmtpError::new(501, EnhancedCode::Set(5, 5, 2), message)
}

fn parameter_error(message: impl Into<String>) -> SmtpError {
    SmtpError::new(501, EnhancedCode::Set(5, 5, 4), message)
}

/// Splits a raw command line into its uppercased verb and the remainder
/// after the first space.
///
/// An empty line yields an empty verb (the dispatcher has a special answer
/// for that); a verb containing anything but ASCII alphanumerics is a
/// malformed line.
pub(crate) fn parse_command(line: &str) -> Result<(String, String), ()> {
    let (verb, arg) = match line.split_once(' ') {
        Some((verb, arg)) => (verb, arg),
        None => (line, ""),
    };

    if !verb.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(());
    }

    Ok((verb.to_ascii_uppercase(), arg.to_owned()))
}

/// Extracts the domain / address literal from a HELO/EHLO/LHLO argument.
///
/// Anything after the first space (client software advertisements and the
/// like) is ignored.
pub(crate) fn parse_hello_argument(arg: &str) -> Result<String, ()> {
    let domain = arg.split(' ').next().unwrap_or("");
    if domain.is_empty() || !RX_HELLO_DOMAIN.is_match(domain) {
        return Err(());
    }

    Ok(domain.to_owned())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MailArgs {
    pub(crate) from: String,
    /// The declared message size from a `SIZE=` parameter, unvalidated
    /// against the configured limit.
    pub(crate) size: Option<u64>,
}

/// Parses the argument of `MAIL`: `FROM:<address>` plus optional ESMTP
/// parameters.
///
/// In strict mode the address must be angle-bracketed; otherwise brackets
/// are stripped tolerantly. `SIZE` is parsed, `BODY` is accepted and
/// ignored (the payload is read bytewise, so the declared encoding has no
/// effect on processing), anything else is rejected.
pub(crate) fn parse_mail_args(
    arg: &str,
    strict: bool,
) -> Result<MailArgs, SmtpError> {
    const SYNTAX: &str = "Was expecting MAIL arg syntax of FROM:<address>";

    if arg.len() < 6
        || !arg.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("FROM:"))
    {
        return Err(syntax_error(SYNTAX));
    }

    let mut tokens = arg[5..].split_whitespace();
    let from_token = tokens.next().unwrap_or("");
    if from_token.is_empty() {
        return Err(syntax_error(SYNTAX));
    }
    if strict
        && !(from_token.starts_with('<') && from_token.ends_with('>'))
    {
        return Err(syntax_error(SYNTAX));
    }

    // "<>" reduces to the empty string here, which is the null return path.
    let from = from_token.trim_matches(|c| '<' == c || '>' == c).to_owned();

    let mut size = None::<u64>;
    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            return Err(parameter_error(
                "Unable to parse MAIL ESMTP parameters",
            ));
        };

        match key.to_ascii_uppercase().as_str() {
            "SIZE" => match value.parse::<u64>() {
                Ok(v) => size = Some(v),
                Err(_) => {
                    return Err(parameter_error(
                        "Unable to parse SIZE as an integer",
                    ))
                },
            },
            "BODY" => (),
            _ => {
                return Err(parameter_error(
                    "Unable to parse MAIL ESMTP parameters",
                ))
            },
        }
    }

    Ok(MailArgs { from, size })
}

/// Parses the argument of `RCPT`: `TO:<address>`.
///
/// No RCPT ESMTP parameters are recognized, so trailing tokens are
/// rejected outright.
pub(crate) fn parse_rcpt_args(
    arg: &str,
    strict: bool,
) -> Result<String, SmtpError> {
    const SYNTAX: &str = "Was expecting RCPT arg syntax of TO:<address>";

    if arg.len() < 4
        || !arg.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("TO:"))
    {
        return Err(syntax_error(SYNTAX));
    }

    let mut tokens = arg[3..].split_whitespace();
    let to_token = tokens.next().unwrap_or("");
    if to_token.is_empty() {
        return Err(syntax_error(SYNTAX));
    }
    if strict && !(to_token.starts_with('<') && to_token.ends_with('>')) {
        return Err(syntax_error(SYNTAX));
    }

    let to = to_token.trim_matches(|c| '<' == c || '>' == c).to_owned();
    if to.is_empty() {
        return Err(syntax_error(SYNTAX));
    }

    if tokens.next().is_some() {
        return Err(parameter_error(
            "Unable to parse RCPT ESMTP parameters",
        ));
    }

    Ok(to)
}

/// The attributes carried by one XFORWARD command. Absent fields leave the
/// connection's stored values untouched.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct XForwardUpdate {
    pub(crate) name: Option<String>,
    pub(crate) addr: Option<String>,
    pub(crate) proto: Option<String>,
    pub(crate) helo: Option<String>,
}

/// Parses XFORWARD attribute tokens.
///
/// The update is all-or-nothing: an unknown or malformed attribute fails
/// the whole command without touching previously forwarded values.
pub(crate) fn parse_xforward(arg: &str) -> Result<XForwardUpdate, ()> {
    let mut update = XForwardUpdate::default();
    let mut any = false;

    for token in arg.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            return Err(());
        };

        let slot = match key.to_ascii_uppercase().as_str() {
            "NAME" => &mut update.name,
            "ADDR" => &mut update.addr,
            "PROTO" => &mut update.proto,
            "HELO" => &mut update.helo,
            _ => return Err(()),
        };
        *slot = Some(value.to_owned());
        any = true;
    }

    if !any {
        return Err(());
    }

    Ok(update)
}

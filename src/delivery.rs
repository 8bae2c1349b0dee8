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

//! The rendezvous between the session's delivery workers and the
//! connection task.
//!
//! In LMTP mode the session may fan deliveries out over as many tasks as it
//! likes; each recipient gets a capacity-1 status channel plus a
//! cancellation token, and after the data transfer the connection collects
//! one status per recipient in RCPT acceptance order. A status that arrives
//! after its token was cancelled is silently discarded.

use std::collections::HashMap;
use std::sync::Mutex;

use log::warn;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codes::{EnhancedCode, SmtpError};
use crate::conn::XForward;
use crate::log_prefix::LogPrefix;

/// The capability object passed to [`Session::data`](crate::Session::data).
///
/// All methods take `&self`; the context is shared behind an `Arc` so
/// worker tasks spawned by the session can report statuses from anywhere.
pub struct DataContext {
    helo: String,
    xforward: XForward,
    log_prefix: LogPrefix,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    smtp_response: Option<SmtpError>,
    slots: HashMap<String, RcptSlot>,
}

struct RcptSlot {
    token: CancellationToken,
    tx: mpsc::Sender<SmtpError>,
    rx: Option<mpsc::Receiver<SmtpError>>,
}

impl DataContext {
    pub(crate) fn new(
        helo: String,
        xforward: XForward,
        log_prefix: LogPrefix,
    ) -> Self {
        DataContext {
            helo,
            xforward,
            log_prefix,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The host name from the client's greeting.
    pub fn helo(&self) -> &str {
        &self.helo
    }

    /// The forwarded client attributes accumulated from XFORWARD commands,
    /// all empty unless a trusted relay supplied them.
    pub fn xforward(&self) -> XForward {
        self.xforward.clone()
    }

    /// Overrides the final reply for a successful SMTP-mode transaction.
    ///
    /// Ignored in LMTP mode, where per-recipient statuses are the source of
    /// truth.
    pub fn set_smtp_response(&self, response: SmtpError) {
        self.inner.lock().unwrap().smtp_response = Some(response);
    }

    /// Registers a delivery for `rcpt` (case-insensitive).
    ///
    /// Must be called before the data handler returns for the recipient's
    /// status to be awaited; cancelling `token` makes the server stop
    /// waiting and answer with a timeout temp-failure.
    pub fn start_delivery(&self, token: CancellationToken, rcpt: &str) {
        let (tx, rx) = mpsc::channel(1);
        self.inner.lock().unwrap().slots.insert(
            rcpt.to_lowercase(),
            RcptSlot {
                token,
                tx,
                rx: Some(rx),
            },
        );
    }

    /// Reports the delivery status for `rcpt`. Never blocks.
    pub fn set_status(&self, rcpt: &str, status: SmtpError) {
        let inner = self.inner.lock().unwrap();
        match inner.slots.get(&rcpt.to_lowercase()) {
            Some(slot) => {
                // The send fails if a status was already delivered or the
                // server gave up on this recipient; either way the late
                // status is dropped.
                let _ = slot.tx.try_send(status);
            },
            None => warn!(
                "{} delivery status for <{}> without start_delivery",
                self.log_prefix, rcpt,
            ),
        }
    }

    pub(crate) fn take_smtp_response(&self) -> Option<SmtpError> {
        self.inner.lock().unwrap().smtp_response.take()
    }

    /// Takes the waitable half of the recipient's slot. The sender stays
    /// behind so late worker statuses have somewhere to go quietly.
    pub(crate) fn take_slot(
        &self,
        rcpt: &str,
    ) -> Option<(CancellationToken, mpsc::Receiver<SmtpError>)> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.get_mut(rcpt)?;
        let rx = slot.rx.take()?;
        Some((slot.token.clone(), rx))
    }
}

/// The reply used when a recipient's delivery was cancelled, timed out, or
/// was never started.
pub(crate) fn timeout_status() -> SmtpError {
    SmtpError::new(
        420,
        EnhancedCode::Set(4, 4, 7),
        "Error: timeout reached",
    )
}

/// Waits for the status of one recipient: whichever of the status channel
/// and the cancellation token wins determines the reply.
pub(crate) async fn await_status(
    ctx: &DataContext,
    rcpt: &str,
) -> SmtpError {
    let Some((token, mut rx)) = ctx.take_slot(rcpt) else {
        return timeout_status();
    };

    tokio::select! {
        _ = token.cancelled() => timeout_status(),
        status = rx.recv() => status.unwrap_or_else(timeout_status),
    }
}

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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for a connection.
///
/// Clones of a `LogPrefix` share the same underlying data, so a later
/// `set_helo` shows up in log statements made from contexts that captured
/// the prefix earlier.
#[derive(Clone)]
pub(crate) struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    protocol: String,
    helo: Option<String>,
}

impl LogPrefix {
    pub(crate) fn new(protocol: String) -> Self {
        LogPrefix {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                helo: None,
            })),
        }
    }

    pub(crate) fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.protocol)?;
        if let Some(ref helo) = inner.helo {
            write!(f, "[{}]", helo)?;
        }

        Ok(())
    }
}

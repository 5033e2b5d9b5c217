// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The low-level mechanics of the readiness-based reactor: the pending-event bitmask, and a thin
//! wrapper around `poll(2)` used to learn which registered file descriptors are ready.
//!
//! [`crate::core::RpcCore`] owns the connection slab and drives the actual per-connection state
//! machine; this module only deals in raw file descriptors and readiness bits.

use bitflags::bitflags;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

bitflags! {
    /// Events a connection may be waiting on. Several bits may be set at once (e.g. a
    /// connection mid-linger watches both [`PendingEvent::WRITE`] and [`PendingEvent::LINGER`]).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PendingEvent: u32 {
        const READ            = 1 << 0;
        const WRITE           = 1 << 1;
        const LINGER          = 1 << 2;
        const LINGER_SILENT   = 1 << 3;
        const CLOSE           = 1 << 4;
        const REMOVE          = 1 << 5;
        const TIMEOUT         = 1 << 6;
        const CONNECT         = 1 << 7;
        const IDLE            = 1 << 8;
        const ERROR           = 1 << 9;
    }
}

/// Readiness reported for one polled file descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// A single registration passed to [`Poller::poll`].
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}

/// A thin wrapper over `poll(2)`. Kept separate from socket ownership so the reactor can poll
/// listener, control, and connection file descriptors uniformly without holding references
/// into [`crate::core::RpcCore`]'s connection slab across the syscall.
pub struct Poller {
    fds: Vec<libc::pollfd>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        Poller { fds: Vec::new() }
    }

    /// Runs one `poll(2)` call over `registrations`, returning per-fd readiness in the same
    /// order. `timeout` of `None` blocks indefinitely; `Some(Duration::ZERO)` returns
    /// immediately.
    ///
    /// Retries internally on `EINTR` (a signal arriving mid-call is not reported as an error;
    /// the caller's own interrupt/control-socket readiness is what signals a wakeup).
    pub fn poll(
        &mut self,
        registrations: &[Registration],
        timeout: Option<Duration>,
    ) -> io::Result<Vec<Readiness>> {
        self.fds.clear();
        self.fds.reserve(registrations.len());
        for reg in registrations {
            let mut events = 0;
            if reg.read {
                events |= libc::POLLIN;
            }
            if reg.write {
                events |= libc::POLLOUT;
            }
            self.fds.push(libc::pollfd {
                fd: reg.fd,
                events: events as i16,
                revents: 0,
            });
        }

        let timeout_ms: i32 = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };

        loop {
            let ret = unsafe {
                libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms)
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break;
        }

        Ok(self
            .fds
            .iter()
            .map(|pfd| Readiness {
                readable: pfd.revents & libc::POLLIN != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
            })
            .collect())
    }
}

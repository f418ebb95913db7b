// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interrupt wait primitive.

use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IrqError {
    #[error("failed to create event: {0}")]
    EventFd(Errno),
    #[error("failed to create Epoll: {0}")]
    Epoll(Errno),
    #[error("failed to add event to Epoll: {0}")]
    EpollAdd(Errno),
    #[error("failed to wait for interrupt: {0}")]
    Wait(Errno),
    #[error("failed to signal interrupt: {0}")]
    Signal(Errno),
    #[error("invalid wait timeout {0:?}")]
    Timeout(Duration),
}

/// An interrupt line, signalled by writing to an event file descriptor.
///
/// Platform integrations forward the hardware interrupt to [`IrqEvent::trigger`] (or hand the
/// kernel the descriptor returned by [`AsFd::as_fd`]); the engine's interrupt threads block in
/// [`IrqEvent::wait`].
pub struct IrqEvent {
    event: EventFd,
    epoll: Epoll,
}

impl IrqEvent {
    pub fn new() -> Result<Self, IrqError> {
        let event = EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(IrqError::EventFd)?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(IrqError::Epoll)?;
        epoll
            .add(event.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 0))
            .map_err(IrqError::EpollAdd)?;

        Ok(Self { event, epoll })
    }

    /// Signals the interrupt. Signals arriving before a wait are coalesced.
    pub fn trigger(&self) -> Result<(), IrqError> {
        self.event.write(1).map(|_| ()).map_err(IrqError::Signal)
    }

    /// Waits for the interrupt for at most `timeout`.
    ///
    /// Returns `true` if the interrupt fired and `false` on timeout. Pending signals are consumed.
    pub fn wait(&self, timeout: Duration) -> Result<bool, IrqError> {
        let epoll_timeout =
            EpollTimeout::try_from(timeout).map_err(|_| IrqError::Timeout(timeout))?;
        let mut events = [EpollEvent::empty()];

        match self.epoll.wait(&mut events, epoll_timeout) {
            Ok(0) => Ok(false),
            Ok(_) => self.clear(),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(IrqError::Wait(e)),
        }
    }

    /// Consumes any pending signal without waiting. Returns whether one was pending.
    pub fn clear(&self) -> Result<bool, IrqError> {
        match self.event.read() {
            Ok(_) => Ok(true),
            // Another waiter consumed the signal first.
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(IrqError::Wait(e)),
        }
    }
}

impl AsFd for IrqEvent {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.event.as_fd()
    }
}

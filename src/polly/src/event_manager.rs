// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A cooperative event loop multiplexing fds over one epoll instance.
//!
//! Callbacks run to completion on the loop thread; there is no preemption.
//! A subscriber may unregister any fd from inside its callback, including an
//! fd whose event is already sitting in the batch currently being dispatched.
//! In that case the pending event is suppressed, so a callback never fires
//! for an fd the subscriber just tore down.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use utils::epoll::{ControlOperation, Epoll, EpollEvent};

/// Maximum number of events dispatched per epoll_wait call.
const EVENT_BATCH_SIZE: usize = 32;

#[derive(Debug)]
pub enum Error {
    /// Cannot create the epoll instance.
    EpollCreate(io::Error),
    /// Polling for events failed.
    Poll(io::Error),
    /// Updating the epoll interest list failed.
    EpollCtl(io::Error),
    /// The fd is already registered.
    FdAlreadyRegistered(RawFd),
    /// The fd is not registered.
    FdNotRegistered(RawFd),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            EpollCreate(e) => write!(f, "unable to create epoll fd: {e}"),
            Poll(e) => write!(f, "error during epoll call: {e}"),
            EpollCtl(e) => write!(f, "error updating epoll interest list: {e}"),
            FdAlreadyRegistered(fd) => write!(f, "fd {fd} is already registered"),
            FdNotRegistered(fd) => write!(f, "fd {fd} is not registered"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A subscriber provides its initial fd interest and handles dispatched
/// events. Multiple fds can be routed to one subscriber.
pub trait Subscriber {
    /// Handle one event. The event's `data` field carries the fd it was
    /// registered for.
    fn process(&mut self, event: &EpollEvent, event_manager: &mut EventManager);

    /// The fds and event sets to register when the subscriber is added.
    fn interest_list(&self) -> Vec<EpollEvent>;
}

/// Single-threaded fd multiplexer.
pub struct EventManager {
    epoll: Epoll,
    subscribers: HashMap<RawFd, Arc<Mutex<dyn Subscriber>>>,
    ready_events: Vec<EpollEvent>,

    // Bookkeeping over the batch currently being dispatched, so that
    // `unregister` can null out events for fds deleted mid-batch.
    dispatch_pos: usize,
    dispatch_count: usize,
}

impl EventManager {
    pub fn new() -> Result<EventManager> {
        let epoll = Epoll::new().map_err(Error::EpollCreate)?;
        Ok(EventManager {
            epoll,
            subscribers: HashMap::new(),
            ready_events: vec![EpollEvent::default(); EVENT_BATCH_SIZE],
            dispatch_pos: 0,
            dispatch_count: 0,
        })
    }

    /// Add a subscriber, registering every fd from its interest list.
    pub fn add_subscriber(&mut self, subscriber: Arc<Mutex<dyn Subscriber>>) -> Result<()> {
        let interest_list = subscriber
            .lock()
            .expect("poisoned subscriber lock")
            .interest_list();

        for event in interest_list {
            self.register(event.fd(), event, subscriber.clone())?;
        }

        Ok(())
    }

    /// Register `fd` with `event` interest, routed to `subscriber`.
    pub fn register(
        &mut self,
        fd: RawFd,
        event: EpollEvent,
        subscriber: Arc<Mutex<dyn Subscriber>>,
    ) -> Result<()> {
        if self.subscribers.contains_key(&fd) {
            return Err(Error::FdAlreadyRegistered(fd));
        }

        self.epoll
            .ctl(ControlOperation::Add, fd, &event)
            .map_err(Error::EpollCtl)?;
        self.subscribers.insert(fd, subscriber);

        Ok(())
    }

    /// Remove `fd` from the interest list.
    ///
    /// Safe to call from inside a dispatched callback for any registered fd:
    /// if the fd still has an event queued in the in-flight batch, that event
    /// is suppressed.
    pub fn unregister(&mut self, fd: RawFd) -> Result<()> {
        self.subscribers
            .remove(&fd)
            .ok_or(Error::FdNotRegistered(fd))?;

        self.epoll
            .ctl(ControlOperation::Delete, fd, &EpollEvent::default())
            .map_err(Error::EpollCtl)?;

        // The caller may be tearing this fd down from another fd's callback.
        // Null out any not-yet-dispatched event targeting it.
        for pos in self.dispatch_pos + 1..self.dispatch_count {
            if self.ready_events[pos].fd() == fd {
                self.ready_events[pos] = EpollEvent::default();
            }
        }

        Ok(())
    }

    /// Look up the subscriber registered for `fd`.
    pub fn subscriber(&self, fd: RawFd) -> Result<Arc<Mutex<dyn Subscriber>>> {
        self.subscribers
            .get(&fd)
            .cloned()
            .ok_or(Error::FdNotRegistered(fd))
    }

    /// Wait for events indefinitely and dispatch them.
    pub fn run(&mut self) -> Result<usize> {
        self.run_with_timeout(-1)
    }

    /// Wait for events for at most `milliseconds` ms and dispatch them.
    pub fn run_with_timeout(&mut self, milliseconds: i32) -> Result<usize> {
        let event_count = self
            .epoll
            .wait(EVENT_BATCH_SIZE, milliseconds, &mut self.ready_events[..])
            .map_err(Error::Poll)?;

        self.dispatch_count = event_count;
        self.dispatch_pos = 0;

        while self.dispatch_pos < self.dispatch_count {
            let event = self.ready_events[self.dispatch_pos];

            // A zeroed event was unregistered while in flight.
            if event.events() != 0 {
                match self.subscribers.get(&event.fd()) {
                    Some(subscriber) => {
                        let subscriber = subscriber.clone();
                        subscriber
                            .lock()
                            .expect("poisoned subscriber lock")
                            .process(&event, self);
                    }
                    None => warn!("event on unregistered fd {}", event.fd()),
                }
            }

            self.dispatch_pos += 1;
        }

        self.dispatch_pos = 0;
        self.dispatch_count = 0;

        Ok(event_count)
    }
}

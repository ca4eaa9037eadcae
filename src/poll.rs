//! Readiness multiplexer: a thin wrapper over [`mio::Poll`].
//!
//! One `Poller` owns the OS watch set and the event buffer. Sources are
//! identified by [`Token`]: `Token(0)` is reserved for the shutdown waker,
//! `Token(1)` for the listening socket, and everything above belongs to
//! client connections. `poll` copies readiness out into plain [`Readiness`]
//! values so callers can mutate the watch set while walking the batch.

use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::Result;

/// Token reserved for the shutdown waker.
pub const WAKER: Token = Token(0);
/// Token reserved for the listening socket.
pub const LISTENER: Token = Token(1);
/// First token handed out to client connections.
pub const FIRST_CONNECTION: u64 = 2;

/// One readiness notification, decoupled from the poll's event buffer.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
        }
    }
}

pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl Poller {
    pub fn new(events_capacity: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity),
            waker,
        })
    }

    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().register(source, token, interest)?;
        Ok(())
    }

    /// Update a source's interest mask without changing its identity.
    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)?;
        Ok(())
    }

    pub fn deregister<S>(&self, source: &mut S) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().deregister(source)?;
        Ok(())
    }

    /// Block until at least one source is ready or the timeout elapses.
    ///
    /// A signal landing mid-wait interrupts the underlying syscall; the
    /// wait is retried rather than surfacing `Interrupted` to the caller.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Readiness>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.events.iter().map(Readiness::from).collect())
    }

    /// Handle that interrupts an in-flight `poll` from another thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_times_out_on_idle_set() {
        let mut poller = Poller::new(1024).unwrap();
        let events = poller.poll(Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn poll_survives_signal_interruption() {
        use std::os::unix::thread::JoinHandleExt;

        extern "C" fn noop(_: libc::c_int) {}
        unsafe {
            libc::signal(libc::SIGUSR1, noop as libc::sighandler_t);
        }

        let mut poller = Poller::new(64).unwrap();
        let waker = poller.waker();
        let polling =
            std::thread::spawn(move || poller.poll(Some(Duration::from_secs(5))).unwrap());

        // land a signal in the middle of the wait, then wake it for real
        std::thread::sleep(Duration::from_millis(50));
        unsafe {
            libc::pthread_kill(polling.as_pthread_t() as libc::pthread_t, libc::SIGUSR1);
        }
        std::thread::sleep(Duration::from_millis(50));
        waker.wake().unwrap();

        let events = polling.join().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, WAKER);
    }

    #[test]
    fn waker_interrupts_poll() {
        let mut poller = Poller::new(64).unwrap();
        let waker = poller.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let events = poller.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, WAKER);
        handle.join().unwrap();
    }
}

//! Event multiplexer
//!
//! Readiness-based wait over many descriptors, used by every process's main
//! loop. Descriptors are registered level-triggered for readability, so a
//! descriptor with unread data is reported again on the next wait.

use std::collections::HashSet;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use polling::{Event, Events, PollMode, Poller};

use crate::error::Result;

/// Readiness wait over a set of descriptors
pub struct Multiplexer {
    poller: Arc<Poller>,
    events: Events,
    watched: HashSet<RawFd>,
}

impl Multiplexer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            events: Events::new(),
            watched: HashSet::new(),
        })
    }

    /// Report `source` whenever it is readable.
    ///
    /// The source must be unwatched before it is closed.
    pub fn watch<F: AsRawFd>(&mut self, source: &F) -> Result<()> {
        let fd = source.as_raw_fd();
        if self.watched.contains(&fd) {
            return Ok(());
        }
        // SAFETY: callers unwatch before dropping the source
        unsafe {
            self.poller
                .add_with_mode(fd, Event::readable(fd as usize), PollMode::Level)?;
        }
        self.watched.insert(fd);
        tracing::trace!(fd = fd, "Descriptor watched");
        Ok(())
    }

    /// Stop reporting `source`
    pub fn unwatch<F: AsFd>(&mut self, source: &F) -> Result<()> {
        let fd = source.as_fd().as_raw_fd();
        if self.watched.remove(&fd) {
            self.poller.delete(source.as_fd())?;
            tracing::trace!(fd = fd, "Descriptor unwatched");
        }
        Ok(())
    }

    pub fn is_watched(&self, fd: RawFd) -> bool {
        self.watched.contains(&fd)
    }

    /// Number of watched descriptors
    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// Block until at least one descriptor is ready or `timeout` passes.
    ///
    /// `None` waits indefinitely. Returns the ready descriptors, empty on
    /// timeout or wake-up.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<RawFd>> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut ready = Vec::with_capacity(self.events.len());
        for event in self.events.iter() {
            let fd = event.key as RawFd;
            if self.watched.contains(&fd) && !ready.contains(&fd) {
                ready.push(fd);
            }
        }
        Ok(ready)
    }

    /// Interrupt a concurrent or the next [`wait`](Self::wait)
    pub fn wake(&self) -> Result<()> {
        self.poller.notify()?;
        Ok(())
    }

    /// Handle that can interrupt [`wait`](Self::wait) from another thread
    pub fn waker(&self) -> MuxWaker {
        MuxWaker {
            poller: Arc::clone(&self.poller),
        }
    }
}

/// Cross-thread wake-up handle for a [`Multiplexer`]
#[derive(Clone)]
pub struct MuxWaker {
    poller: Arc<Poller>,
}

impl MuxWaker {
    pub fn wake(&self) -> Result<()> {
        self.poller.notify()?;
        Ok(())
    }
}

impl std::fmt::Debug for MuxWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxWaker").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("watched", &self.watched)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn test_reports_readable_descriptor() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut mux = Multiplexer::new().unwrap();
        mux.watch(&b).unwrap();

        a.write_all(b"x").unwrap();
        let ready = mux.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready, vec![b.as_raw_fd()]);
    }

    #[test]
    fn test_level_triggered_until_drained() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut mux = Multiplexer::new().unwrap();
        mux.watch(&b).unwrap();

        a.write_all(b"xy").unwrap();
        assert_eq!(mux.wait(Some(Duration::from_secs(1))).unwrap().len(), 1);
        // Nothing was read, so it is still ready
        assert_eq!(mux.wait(Some(Duration::from_secs(1))).unwrap().len(), 1);
    }

    #[test]
    fn test_timeout_returns_empty() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut mux = Multiplexer::new().unwrap();
        mux.watch(&b).unwrap();

        let ready = mux.wait(Some(Duration::from_millis(20))).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_unwatch_silences_descriptor() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut mux = Multiplexer::new().unwrap();
        mux.watch(&b).unwrap();
        mux.unwatch(&b).unwrap();
        assert!(mux.is_empty());

        a.write_all(b"x").unwrap();
        let ready = mux.wait(Some(Duration::from_millis(20))).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_many_descriptors() {
        let pairs: Vec<_> = (0..4).map(|_| UnixStream::pair().unwrap()).collect();
        let mut mux = Multiplexer::new().unwrap();
        for (_, b) in &pairs {
            mux.watch(b).unwrap();
        }
        // Watching twice is a no-op
        mux.watch(&pairs[0].1).unwrap();
        assert_eq!(mux.len(), 4);

        (&pairs[1].0).write_all(b"1").unwrap();
        (&pairs[3].0).write_all(b"3").unwrap();

        let mut ready = mux.wait(Some(Duration::from_secs(1))).unwrap();
        ready.sort();
        let mut expected = vec![pairs[1].1.as_raw_fd(), pairs[3].1.as_raw_fd()];
        expected.sort();
        assert_eq!(ready, expected);
    }

    #[test]
    fn test_wake_interrupts_wait() {
        let mut mux = Multiplexer::new().unwrap();
        mux.wake().unwrap();
        let ready = mux.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_waker_from_other_thread() {
        let mut mux = Multiplexer::new().unwrap();
        let waker = mux.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let started = std::time::Instant::now();
        let ready = mux.wait(None).unwrap();
        assert!(ready.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}

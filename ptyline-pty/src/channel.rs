//! Non-blocking byte channel over the pty master
//!
//! Reads are delivered in chunks of at most [`READ_CHUNK`] bytes. Writes go
//! straight to the descriptor while nothing is queued; once the kernel
//! buffer is full the remainder is parked in a FIFO of [`PendingWrite`]s
//! and [`IoChannel::drain`] has to be called on every tick until the
//! channel reports [`DrainState::Idle`] again. Bytes reach the child in the
//! order they were sent.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// Maximum bytes delivered per read
pub const READ_CHUNK: usize = 4096;

/// Whether queued writes are waiting for the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// Nothing queued; no drain ticks needed
    Idle,
    /// Queue non-empty; call `drain` on the next zero-delay tick
    Draining,
}

/// Bytes that could not be written yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    buffer: Vec<u8>,
    offset: usize,
}

impl PendingWrite {
    fn new(bytes: &[u8]) -> Self {
        Self {
            buffer: bytes.to_vec(),
            offset: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }

    fn unwritten(&self) -> &[u8] {
        &self.buffer[self.offset..]
    }

    fn advance(&mut self, written: usize) {
        self.offset = (self.offset + written).min(self.buffer.len());
    }
}

/// Outcome of a single write attempt
enum Attempt {
    Wrote(usize),
    Blocked,
    Failed(io::Error),
}

fn attempt_write<T: Write>(inner: &mut T, bytes: &[u8]) -> Attempt {
    match inner.write(bytes) {
        // a zero-length write would spin forever; treat it as a full buffer
        Ok(0) => Attempt::Blocked,
        Ok(n) => Attempt::Wrote(n),
        Err(e) if is_transient(&e) => Attempt::Blocked,
        Err(e) => Attempt::Failed(e),
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Single-descriptor channel with a pending-write queue
pub struct IoChannel<T> {
    inner: T,
    queue: VecDeque<PendingWrite>,
    tee: Option<Box<dyn Write>>,
}

impl<T: Read + Write> IoChannel<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            queue: VecDeque::new(),
            tee: None,
        }
    }

    /// Copy every received byte to `sink` as well (debug log).
    ///
    /// The first failing write to the sink disables it.
    pub fn set_tee(&mut self, sink: Option<Box<dyn Write>>) {
        self.tee = sink;
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Take the transport back, discarding queued writes
    pub fn into_inner(self) -> T {
        if !self.queue.is_empty() {
            log::debug!(
                "Discarding {} queued bytes",
                self.queue.iter().map(PendingWrite::remaining).sum::<usize>()
            );
        }
        self.inner
    }

    pub fn state(&self) -> DrainState {
        if self.queue.is_empty() {
            DrainState::Idle
        } else {
            DrainState::Draining
        }
    }

    /// Bytes waiting in the queue
    pub fn queued_bytes(&self) -> usize {
        self.queue.iter().map(PendingWrite::remaining).sum()
    }

    /// Read one chunk and hand it to `deliver`.
    ///
    /// Returns the number of bytes delivered, or `None` when the read
    /// produced nothing (would block, interrupted, or an error the next
    /// readiness event will surface again).
    pub fn on_readable<F>(&mut self, mut deliver: F) -> Option<usize>
    where
        F: FnMut(&[u8]),
    {
        let mut buf = [0u8; READ_CHUNK];
        let n = match self.inner.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                if !is_transient(&e) {
                    log::trace!("pty read: {}", e);
                }
                return None;
            }
        };

        deliver(&buf[..n]);

        if let Some(sink) = self.tee.as_mut() {
            if let Err(e) = sink.write_all(&buf[..n]).and_then(|()| sink.flush()) {
                log::warn!("Disabling pty tee: {}", e);
                self.tee = None;
            }
        }

        Some(n)
    }

    /// Send bytes towards the child.
    ///
    /// A full kernel buffer is not an error: the unwritten remainder is
    /// queued and the channel switches to [`DrainState::Draining`]. A
    /// persistent write error drops the remainder and is returned.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if !self.queue.is_empty() {
            self.enqueue(bytes);
            return Ok(());
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            match attempt_write(&mut self.inner, rest) {
                Attempt::Wrote(n) => rest = &rest[n..],
                Attempt::Blocked => {
                    self.enqueue(rest);
                    return Ok(());
                }
                Attempt::Failed(e) => {
                    log::warn!("pty write failed, dropping {} bytes: {}", rest.len(), e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Queue bytes behind anything already pending, without writing
    pub fn enqueue(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.queue.push_back(PendingWrite::new(bytes));
        }
    }

    /// One drain tick: write from the front of the queue until it is empty,
    /// the descriptor fills up, or a write fails. A failed entry is dropped
    /// and ends the tick.
    pub fn drain(&mut self) -> DrainState {
        while let Some(job) = self.queue.front_mut() {
            match attempt_write(&mut self.inner, job.unwritten()) {
                Attempt::Wrote(n) => {
                    job.advance(n);
                    if job.remaining() == 0 {
                        self.queue.pop_front();
                    }
                }
                Attempt::Blocked => break,
                Attempt::Failed(e) => {
                    log::warn!(
                        "pty write failed, dropping {} queued bytes: {}",
                        job.remaining(),
                        e
                    );
                    self.queue.pop_front();
                    break;
                }
            }
        }
        self.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Transport that accepts at most `max` bytes per call and reports a
    /// full buffer on every `block_every`-th call
    #[derive(Default)]
    struct Trickle {
        accepted: Vec<u8>,
        max: usize,
        block_every: usize,
        calls: usize,
        fail_on: Option<usize>,
        incoming: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Trickle {
        fn new(max: usize, block_every: usize) -> Self {
            Self {
                max,
                block_every,
                ..Default::default()
            }
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.fail_on == Some(self.calls) {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            if self.block_every > 0 && self.calls % self.block_every == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.max);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.incoming.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::Other))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_direct_write_when_idle() {
        let mut channel = IoChannel::new(Trickle::new(usize::MAX, 0));
        channel.send(b"hello").unwrap();
        assert_eq!(channel.state(), DrainState::Idle);
        assert_eq!(channel.get_ref().accepted, b"hello");
    }

    #[test]
    fn test_partial_writes_loop_until_done() {
        let mut channel = IoChannel::new(Trickle::new(2, 0));
        channel.send(b"abcdefg").unwrap();
        assert_eq!(channel.state(), DrainState::Idle);
        assert_eq!(channel.get_ref().accepted, b"abcdefg");
        assert_eq!(channel.get_ref().calls, 4);
    }

    #[test]
    fn test_blocked_write_is_queued() {
        let mut channel = IoChannel::new(Trickle::new(3, 2));
        channel.send(b"abcdef").unwrap();
        assert_eq!(channel.get_ref().accepted, b"abc");
        assert_eq!(channel.state(), DrainState::Draining);
        assert_eq!(channel.queued_bytes(), 3);

        // queued data goes first, even though the transport is writable
        channel.send(b"gh").unwrap();
        assert_eq!(channel.get_ref().accepted, b"abc");
        assert_eq!(channel.queued_bytes(), 5);

        while channel.drain() == DrainState::Draining {}
        assert_eq!(channel.get_ref().accepted, b"abcdefgh");
    }

    #[test]
    fn test_failed_drain_drops_only_front_entry() {
        let mut trickle = Trickle::new(usize::MAX, 0);
        trickle.fail_on = Some(2);
        let mut channel = IoChannel::new(trickle);
        channel.enqueue(b"lost");
        channel.enqueue(b"kept");

        // first call of the tick fails the front entry and ends the tick
        channel.get_mut().calls = 1;
        assert_eq!(channel.drain(), DrainState::Draining);
        assert_eq!(channel.queued_bytes(), 4);

        assert_eq!(channel.drain(), DrainState::Idle);
        assert_eq!(channel.get_ref().accepted, b"kept");
    }

    #[test]
    fn test_direct_write_failure_keeps_channel_open() {
        let mut trickle = Trickle::new(usize::MAX, 0);
        trickle.fail_on = Some(1);
        let mut channel = IoChannel::new(trickle);

        assert!(channel.send(b"dropped").is_err());
        assert_eq!(channel.state(), DrainState::Idle);

        channel.send(b"next").unwrap();
        assert_eq!(channel.get_ref().accepted, b"next");
    }

    #[test]
    fn test_interrupted_write_is_queued() {
        struct Interrupted(Vec<u8>, bool);
        impl Write for Interrupted {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if !self.1 {
                    self.1 = true;
                    return Err(io::Error::from(io::ErrorKind::Interrupted));
                }
                self.0.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        impl Read for Interrupted {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
        }

        let mut channel = IoChannel::new(Interrupted(Vec::new(), false));
        channel.send(b"x").unwrap();
        assert_eq!(channel.state(), DrainState::Draining);
        assert_eq!(channel.drain(), DrainState::Idle);
        assert_eq!(channel.get_ref().0, b"x");
    }

    #[test]
    fn test_reads_are_delivered_and_teed() {
        let mut trickle = Trickle::new(usize::MAX, 0);
        trickle.incoming.push_back(Ok(b"first".to_vec()));
        trickle
            .incoming
            .push_back(Err(io::Error::from(io::ErrorKind::WouldBlock)));
        trickle.incoming.push_back(Ok(Vec::new()));
        let mut channel = IoChannel::new(trickle);
        let tee = SharedSink::default();
        channel.set_tee(Some(Box::new(tee.clone())));

        let mut blocks = Vec::new();
        assert_eq!(channel.on_readable(|b| blocks.push(b.to_vec())), Some(5));
        assert_eq!(channel.on_readable(|b| blocks.push(b.to_vec())), None);
        assert_eq!(channel.on_readable(|b| blocks.push(b.to_vec())), Some(0));

        assert_eq!(blocks, vec![b"first".to_vec(), Vec::new()]);
        assert_eq!(&*tee.0.borrow(), b"first");
    }

    #[test]
    fn test_broken_tee_does_not_affect_delivery() {
        let mut trickle = Trickle::new(usize::MAX, 0);
        trickle.incoming.push_back(Ok(b"one".to_vec()));
        trickle.incoming.push_back(Ok(b"two".to_vec()));
        let mut channel = IoChannel::new(trickle);
        channel.set_tee(Some(Box::new(BrokenSink)));

        let mut received = Vec::new();
        channel.on_readable(|b| received.extend_from_slice(b));
        channel.on_readable(|b| received.extend_from_slice(b));
        assert_eq!(received, b"onetwo");
        assert!(channel.tee.is_none());
    }

    #[test]
    fn test_read_chunk_limit() {
        let mut trickle = Trickle::new(usize::MAX, 0);
        trickle.incoming.push_back(Ok(vec![b'x'; READ_CHUNK * 2]));
        let mut channel = IoChannel::new(trickle);
        assert_eq!(channel.on_readable(|_| {}), Some(READ_CHUNK));
    }

    proptest! {
        #[test]
        fn prop_partial_writes_preserve_order(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..32),
            max in 1usize..16,
            block_every in 2usize..6,
            drain_between in any::<bool>(),
        ) {
            let mut channel = IoChannel::new(Trickle::new(max, block_every));
            let mut expected = Vec::new();

            for chunk in &chunks {
                channel.send(chunk).unwrap();
                expected.extend_from_slice(chunk);
                if drain_between {
                    channel.drain();
                }
            }

            let mut ticks = 0;
            while channel.drain() == DrainState::Draining {
                ticks += 1;
                prop_assert!(ticks < 100_000);
            }
            prop_assert_eq!(&channel.get_ref().accepted, &expected);
        }
    }
}

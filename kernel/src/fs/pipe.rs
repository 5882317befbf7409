//! Anonymous pipes
//!
//! A bounded byte ring shared by one read end and one write end. Reads on
//! an empty pipe block while writers exist and return zero once they are
//! gone; writes with no reader fail with EPIPE (the caller raises
//! SIGPIPE).

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    sched::WaitQueue,
};

use super::{FileOps, PollEvents};

/// Pipe capacity in bytes.
pub const PIPE_CAPACITY: usize = 64 * 1024;

struct PipeInner {
    buf: Mutex<VecDeque<u8>>,
    readers: AtomicUsize,
    writers: AtomicUsize,
    /// Poked on every state change; pollers and blocked peers sleep here.
    wq: WaitQueue,
}

/// The read end.
pub struct PipeReader {
    inner: Arc<PipeInner>,
}

/// The write end.
pub struct PipeWriter {
    inner: Arc<PipeInner>,
}

/// Pipe constructor namespace.
pub struct Pipe;

impl Pipe {
    /// Create a connected reader/writer pair.
    pub fn new() -> (Arc<PipeReader>, Arc<PipeWriter>) {
        let inner = Arc::new(PipeInner {
            buf: Mutex::new(VecDeque::new()),
            readers: AtomicUsize::new(1),
            writers: AtomicUsize::new(1),
            wq: WaitQueue::new(),
        });
        (
            Arc::new(PipeReader {
                inner: inner.clone(),
            }),
            Arc::new(PipeWriter { inner }),
        )
    }
}

impl FileOps for PipeReader {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let mut ring = self.inner.buf.lock();
        if ring.is_empty() {
            return if self.inner.writers.load(Ordering::Acquire) == 0 {
                // End of stream.
                Ok(0)
            } else {
                Err(KernelError::WouldBlock)
            };
        }
        let n = buf.len().min(ring.len());
        for slot in buf.iter_mut().take(n) {
            *slot = ring.pop_front().unwrap();
        }
        drop(ring);
        self.inner.wq.wake_all();
        Ok(n)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::BadFd)
    }

    fn poll_ready(&self, mask: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if mask.contains(PollEvents::IN) && !self.inner.buf.lock().is_empty() {
            ready |= PollEvents::IN;
        }
        if self.inner.writers.load(Ordering::Acquire) == 0 {
            ready |= PollEvents::HUP;
        }
        ready
    }

    fn waitq(&self) -> Option<&WaitQueue> {
        Some(&self.inner.wq)
    }

    fn seekable(&self) -> bool {
        false
    }
}

impl FileOps for PipeWriter {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::BadFd)
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
        if self.inner.readers.load(Ordering::Acquire) == 0 {
            return Err(KernelError::BrokenPipe);
        }
        let mut ring = self.inner.buf.lock();
        let room = PIPE_CAPACITY - ring.len();
        if room == 0 {
            return Err(KernelError::WouldBlock);
        }
        let n = buf.len().min(room);
        ring.extend(buf[..n].iter().copied());
        drop(ring);
        self.inner.wq.wake_all();
        Ok(n)
    }

    fn poll_ready(&self, mask: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if mask.contains(PollEvents::OUT) && self.inner.buf.lock().len() < PIPE_CAPACITY {
            ready |= PollEvents::OUT;
        }
        if self.inner.readers.load(Ordering::Acquire) == 0 {
            ready |= PollEvents::ERR;
        }
        ready
    }

    fn waitq(&self) -> Option<&WaitQueue> {
        Some(&self.inner.wq)
    }

    fn seekable(&self) -> bool {
        false
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.inner.readers.fetch_sub(1, Ordering::AcqRel);
        self.inner.wq.wake_all();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.inner.writers.fetch_sub(1, Ordering::AcqRel);
        self.inner.wq.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_drain_then_eof() {
        let (reader, writer) = Pipe::new();
        assert_eq!(writer.write(0, b"bonjour").unwrap(), 7);
        drop(writer);

        let mut buf = [0u8; 10];
        assert_eq!(reader.read(0, &mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"bonjour");
        // Writer gone and ring drained: end of stream.
        assert_eq!(reader.read(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn empty_pipe_with_writer_would_block() {
        let (reader, _writer) = Pipe::new();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(0, &mut buf), Err(KernelError::WouldBlock));
    }

    #[test]
    fn write_without_reader_is_broken_pipe() {
        let (reader, writer) = Pipe::new();
        drop(reader);
        assert_eq!(writer.write(0, b"x"), Err(KernelError::BrokenPipe));
    }

    #[test]
    fn readiness_tracks_data_and_peer() {
        let (reader, writer) = Pipe::new();
        assert_eq!(reader.poll_ready(PollEvents::IN), PollEvents::empty());
        writer.write(0, b"hi").unwrap();
        assert_eq!(reader.poll_ready(PollEvents::IN), PollEvents::IN);
        assert_eq!(writer.poll_ready(PollEvents::OUT), PollEvents::OUT);
        drop(writer);
        assert!(reader.poll_ready(PollEvents::IN).contains(PollEvents::HUP));
    }

    #[test]
    fn capacity_bounds_writes() {
        let (_reader, writer) = Pipe::new();
        let big = alloc::vec![0u8; PIPE_CAPACITY + 100];
        assert_eq!(writer.write(0, &big).unwrap(), PIPE_CAPACITY);
        assert_eq!(writer.write(0, b"x"), Err(KernelError::WouldBlock));
    }
}

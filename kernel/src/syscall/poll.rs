//! poll / select
//!
//! Both build the same [`Poller`]: entries can be added and removed, and
//! the wait registers on every file's wait queue *before* evaluating
//! readiness, so a readiness change between the predicate check and the
//! sleep can only result in an extra wake-up, never a missed one.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

use crate::{
    error::{KernelError, KernelResult},
    fs::{OpenFile, PollEvents},
    mm::user,
    process::signal,
};

use super::SyscallCtx;

/// Most descriptors one poll call may watch.
const POLL_MAX: usize = 256;

struct PollEntry {
    fd: usize,
    file: Arc<OpenFile>,
    events: PollEvents,
}

/// A readiness multiplexer over open files.
pub struct Poller {
    entries: Vec<PollEntry>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Watch `fd` for `events`.
    pub fn add(&mut self, fd: usize, file: Arc<OpenFile>, events: PollEvents) -> KernelResult<()> {
        if self.entries.len() >= POLL_MAX {
            return Err(KernelError::Invalid);
        }
        self.entries.push(PollEntry { fd, file, events });
        Ok(())
    }

    /// Stop watching `fd`.
    pub fn remove(&mut self, fd: usize) {
        self.entries.retain(|e| e.fd != fd);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate readiness once, without sleeping.
    pub fn poll_once(&self) -> Vec<(usize, PollEvents)> {
        self.entries
            .iter()
            .filter_map(|e| {
                let ready = e.file.ops.poll_ready(e.events);
                (!ready.is_empty()).then_some((e.fd, ready))
            })
            .collect()
    }

    /// Wait until something is ready.
    ///
    /// Registration on every wait queue happens before the readiness
    /// check; the queues are poked on every state change, closing the
    /// check-then-sleep window. Returns EINTR when an unmasked signal
    /// arrives and EAGAIN on timeout, like `thread_sleep`.
    pub fn wait(&self, ctx: &SyscallCtx, nonblock: bool) -> KernelResult<Vec<(usize, PollEvents)>> {
        let tid = ctx.thread.tid;
        loop {
            // Register first.
            for e in &self.entries {
                if let Some(wq) = e.file.ops.waitq() {
                    wq.register(tid);
                }
            }
            let ready = self.poll_once();
            if !ready.is_empty() || nonblock {
                for e in &self.entries {
                    if let Some(wq) = e.file.ops.waitq() {
                        wq.remove(tid);
                    }
                }
                return Ok(ready);
            }

            crate::sched::yield_cpu();
            for e in &self.entries {
                if let Some(wq) = e.file.ops.waitq() {
                    wq.remove(tid);
                }
            }
            let pending = ctx.thread.pending.load(Ordering::SeqCst)
                | ctx.proc_.pending.load(Ordering::SeqCst);
            if signal::next_deliverable(pending, ctx.thread.sigmask()).is_some() {
                return Err(KernelError::Interrupted);
            }
            #[cfg(not(target_os = "none"))]
            return Ok(Vec::new()); // Host tests never block.
        }
    }
}

/// `ppoll(fds, nfds, timeout, sigmask)`; pollfd wire form is
/// `(i32 fd, u16 events, u16 revents)`.
pub fn sys_ppoll(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let fds_ptr = ctx.args[0] as u64;
    let nfds = ctx.args[1];
    if nfds > POLL_MAX {
        return Err(KernelError::Invalid);
    }
    let space = ctx.space();

    let mut poller = Poller::new();
    let mut raw = Vec::new();
    raw.resize(nfds * 8, 0u8);
    user::copyin(&space, fds_ptr, &mut raw)?;
    for chunk in raw.chunks_exact(8) {
        let fd = i32::from_le_bytes(chunk[0..4].try_into().unwrap());
        let events =
            PollEvents::from_bits_truncate(u16::from_le_bytes(chunk[4..6].try_into().unwrap()));
        if fd < 0 {
            continue;
        }
        let file = ctx.proc_.fds.read().get(fd as usize)?;
        poller.add(fd as usize, file, events)?;
    }

    // A null timeout blocks; zero-timeout is the nonblocking probe.
    let nonblock = if ctx.args[2] != 0 {
        let mut t = [0u8; 16];
        user::copyin(&space, ctx.args[2] as u64, &mut t)?;
        t.iter().all(|&b| b == 0)
    } else {
        false
    };

    let ready = poller.wait(ctx, nonblock)?;
    let count = ready.len();
    for (fd, revents) in ready {
        // Locate the record for this fd and write revents back.
        for (i, chunk) in raw.chunks_exact(8).enumerate() {
            let rec_fd = i32::from_le_bytes(chunk[0..4].try_into().unwrap());
            if rec_fd == fd as i32 {
                user::copyout(
                    &space,
                    fds_ptr + (i * 8 + 6) as u64,
                    &revents.bits().to_le_bytes(),
                )?;
                break;
            }
        }
    }
    Ok(count)
}

/// `pselect(nfds, readfds, writefds, exceptfds, timeout, sigmask)` with
/// 64-bit fd_set words.
pub fn sys_pselect(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let nfds = ctx.args[0].min(64);
    let space = ctx.space();

    let read_set = read_fdset(ctx, ctx.args[1])?;
    let write_set = read_fdset(ctx, ctx.args[2])?;
    let _except_set = read_fdset(ctx, ctx.args[3])?;

    let mut poller = Poller::new();
    for fd in 0..nfds {
        let mut events = PollEvents::empty();
        if read_set & (1 << fd) != 0 {
            events |= PollEvents::IN;
        }
        if write_set & (1 << fd) != 0 {
            events |= PollEvents::OUT;
        }
        if events.is_empty() {
            continue;
        }
        let file = ctx.proc_.fds.read().get(fd)?;
        poller.add(fd, file, events)?;
    }

    let nonblock = if ctx.args[4] != 0 {
        let mut t = [0u8; 16];
        user::copyin(&space, ctx.args[4] as u64, &mut t)?;
        t.iter().all(|&b| b == 0)
    } else {
        false
    };

    let ready = poller.wait(ctx, nonblock)?;
    let mut out_read: u64 = 0;
    let mut out_write: u64 = 0;
    let mut count = 0usize;
    for (fd, revents) in ready {
        if revents.intersects(PollEvents::IN | PollEvents::HUP) {
            out_read |= 1 << fd;
            count += 1;
        }
        if revents.contains(PollEvents::OUT) {
            out_write |= 1 << fd;
            count += 1;
        }
    }
    if ctx.args[1] != 0 {
        user::copyout(&space, ctx.args[1] as u64, &out_read.to_le_bytes())?;
    }
    if ctx.args[2] != 0 {
        user::copyout(&space, ctx.args[2] as u64, &out_write.to_le_bytes())?;
    }
    if ctx.args[3] != 0 {
        user::copyout(&space, ctx.args[3] as u64, &0u64.to_le_bytes())?;
    }
    Ok(count)
}

fn read_fdset(ctx: &SyscallCtx, ptr: usize) -> KernelResult<u64> {
    if ptr == 0 {
        return Ok(0);
    }
    let mut raw = [0u8; 8];
    user::copyin(&ctx.space(), ptr as u64, &mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{OpenFlags, Pipe};

    #[test]
    fn poller_add_remove_and_probe() {
        let (reader, writer) = Pipe::new();
        let rfile = OpenFile::new(reader, OpenFlags::RDONLY);
        let wfile = OpenFile::new(writer, OpenFlags::WRONLY);

        let mut poller = Poller::new();
        poller.add(3, rfile.clone(), PollEvents::IN).unwrap();
        poller.add(4, wfile.clone(), PollEvents::OUT).unwrap();
        assert_eq!(poller.len(), 2);

        // Empty pipe: only the writer is ready.
        let ready = poller.poll_once();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, 4);

        // Data arrives: the reader becomes ready too.
        wfile.write(b"x").unwrap();
        let ready = poller.poll_once();
        assert_eq!(ready.len(), 2);

        poller.remove(4);
        let ready = poller.poll_once();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, 3);
    }

    #[test]
    fn poller_sees_hangup() {
        let (reader, writer) = Pipe::new();
        let rfile = OpenFile::new(reader, OpenFlags::RDONLY);
        drop(OpenFile::new(writer, OpenFlags::WRONLY));

        let mut poller = Poller::new();
        poller.add(0, rfile, PollEvents::IN).unwrap();
        let ready = poller.poll_once();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.contains(PollEvents::HUP));
    }
}

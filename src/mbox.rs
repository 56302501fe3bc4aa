//! Fixed-capacity mailbox shared between threads, cores and interrupt handlers.
//!
//! Two semaphores decide who may go ahead: `write_sem` counts free slots,
//! `read_sem` counts filled ones. Moving the ring indices is bookkeeping done
//! with local interrupts masked, so a handler posting on this core can never
//! interleave with the code it interrupted. One slot always stays empty, which
//! keeps `read_pos == write_pos` meaning "empty" and nothing else.

use core::fmt;
use core::marker::PhantomData;

use spin::Mutex;

use crate::irq::{IrqControl, IrqGuard, LocalIrq};
use crate::sync::Semaphore;

struct Ring<T, const N: usize> {
    msgs: [Option<T>; N],
    read_pos: usize,
    write_pos: usize,
}

/// Bounded FIFO of `N - 1` messages.
pub struct Mailbox<T, const N: usize, I: IrqControl = LocalIrq> {
    read_sem: Semaphore,
    write_sem: Semaphore,
    ring: Mutex<Ring<T, N>>,
    _irq: PhantomData<fn() -> I>,
}

/// `try_post` found every slot taken. The message is handed back.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PostError<T> {
    NoSpace(T),
}

impl<T> PostError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PostError::NoSpace(msg) => msg,
        }
    }
}

impl<T> fmt::Debug for PostError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoSpace(..)")
    }
}

impl<T> fmt::Display for PostError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no buffer space left in mailbox")
    }
}

/// `try_recv` found nothing to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    NoMessage,
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no message in mailbox")
    }
}

impl<T, const N: usize, I: IrqControl> Mailbox<T, N, I> {
    /// Creates an empty mailbox with `N` slots, `N - 1` of them usable.
    pub const fn new() -> Self {
        assert!(N >= 2, "a mailbox needs at least two slots");
        Mailbox {
            read_sem: Semaphore::new(0),
            write_sem: Semaphore::new((N - 1) as isize),
            ring: Mutex::new(Ring {
                msgs: [const { None }; N],
                read_pos: 0,
                write_pos: 0,
            }),
            _irq: PhantomData,
        }
    }

    /// Number of slots in the ring.
    pub const fn len(&self) -> usize {
        N
    }

    /// Messages that can be queued at once.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    pub fn is_empty(&self) -> bool {
        let _irqf = IrqGuard::<I>::new();
        let ring = self.ring.lock();
        ring.read_pos == ring.write_pos
    }

    /// Queues `msg` if there is a free slot. Safe to call from an interrupt handler.
    pub fn try_post(&self, msg: T) -> Result<(), PostError<T>> {
        if !self.write_sem.try_down() {
            return Err(PostError::NoSpace(msg));
        }
        self.do_post(msg);
        Ok(())
    }

    /// Takes the oldest message if there is one. Safe to call from an interrupt handler.
    pub fn try_recv(&self) -> Result<T, RecvError> {
        if !self.read_sem.try_down() {
            return Err(RecvError::NoMessage);
        }
        Ok(self.do_recv())
    }

    /// Queues `msg`, spinning until a slot frees up. Not for interrupt context.
    pub fn post(&self, msg: T) {
        self.write_sem.down();
        self.do_post(msg);
    }

    /// Takes the oldest message, spinning until one arrives. Not for interrupt context.
    pub fn recv(&self) -> T {
        self.read_sem.down();
        self.do_recv()
    }

    // Caller holds a `write_sem` token.
    fn do_post(&self, msg: T) {
        {
            let _irqf = IrqGuard::<I>::new();
            let mut ring = self.ring.lock();
            let pos = ring.write_pos;
            ring.msgs[pos] = Some(msg);
            ring.write_pos = (pos + 1) % N;
            assert!(ring.read_pos != ring.write_pos, "mailbox overflow");
        }
        log::trace!("Posted message to mailbox {:p}", self);

        self.read_sem.up();
    }

    // Caller holds a `read_sem` token.
    fn do_recv(&self) -> T {
        log::trace!("Receive message from mailbox {:p}", self);
        let msg = {
            let _irqf = IrqGuard::<I>::new();
            let mut ring = self.ring.lock();
            assert!(ring.read_pos != ring.write_pos, "mailbox underflow");
            let pos = ring.read_pos;
            let msg = ring.msgs[pos].take();
            ring.read_pos = (pos + 1) % N;
            msg
        };

        self.write_sem.up();

        msg.expect("filled mailbox slot was empty")
    }

    #[cfg(test)]
    fn positions(&self) -> (usize, usize) {
        let ring = self.ring.lock();
        (ring.read_pos, ring.write_pos)
    }
}

impl<T, const N: usize, I: IrqControl> Default for Mailbox<T, N, I> {
    fn default() -> Self {
        Self::new()
    }
}

//! Interrupt masking on the local core.

use core::marker::PhantomData;

use x86_64::instructions::interrupts;

/// Save/restore of the local interrupt flag.
pub trait IrqControl {
    type Flags: Copy;

    /// Masks interrupts and returns the previous state.
    fn save() -> Self::Flags;

    /// Puts back a state returned by [`IrqControl::save`].
    fn restore(flags: Self::Flags);
}

/// RFLAGS.IF of the executing core.
pub struct LocalIrq;

impl IrqControl for LocalIrq {
    type Flags = bool;

    fn save() -> bool {
        let enabled = interrupts::are_enabled();
        if enabled {
            interrupts::disable();
        }
        enabled
    }

    fn restore(enabled: bool) {
        if enabled {
            interrupts::enable();
        }
    }
}

/// Keeps interrupts masked until dropped.
///
/// The guard is tied to the core that created it and cannot be sent elsewhere.
pub struct IrqGuard<I: IrqControl = LocalIrq> {
    flags: I::Flags,
    _not_send: PhantomData<*const ()>,
}

impl<I: IrqControl> IrqGuard<I> {
    pub fn new() -> Self {
        IrqGuard {
            flags: I::save(),
            _not_send: PhantomData,
        }
    }
}

impl<I: IrqControl> Default for IrqGuard<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: IrqControl> Drop for IrqGuard<I> {
    fn drop(&mut self) {
        I::restore(self.flags);
    }
}

/// Runs `f` with interrupts masked, restoring the previous state on every exit path.
pub fn without_interrupts<I: IrqControl, R>(f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::<I>::new();
    f()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::Cell;

    use super::IrqControl;

    thread_local! {
        static ENABLED: Cell<bool> = Cell::new(true);
    }

    /// Per-thread stand-in for the interrupt flag.
    pub(crate) struct TestIrq;

    impl TestIrq {
        pub(crate) fn enabled() -> bool {
            ENABLED.with(|e| e.get())
        }
    }

    impl IrqControl for TestIrq {
        type Flags = bool;

        fn save() -> bool {
            ENABLED.with(|e| e.replace(false))
        }

        fn restore(enabled: bool) {
            ENABLED.with(|e| e.set(enabled));
        }
    }
}

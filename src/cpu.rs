//! Per-core records shared by every core in the system.
//!
//! Nothing in here is locked. The bootstrap core fills in a core's entry point
//! and stack before that core is sent its INIT IPI, and from then on only the
//! core itself changes its state.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use x86_64::VirtAddr;

use crate::MAX_CPUS;

/// Code a core runs once it is released.
pub type EntryFn = extern "C" fn();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreState {
    Unborn = 0,
    Running = 1,
    Idle = 2,
    Halted = 3,
}

impl CoreState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CoreState::Running,
            2 => CoreState::Idle,
            3 => CoreState::Halted,
            _ => CoreState::Unborn,
        }
    }
}

/// An idle core could not take new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The core is not idle or already has work queued.
    Busy,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("core is not idle")
    }
}

#[repr(C)]
pub struct CoreRecord {
    entry: AtomicUsize,
    stack: AtomicU64,
    state: AtomicU8,
    pending: AtomicUsize,
}

impl CoreRecord {
    pub const fn new() -> Self {
        CoreRecord {
            entry: AtomicUsize::new(0),
            stack: AtomicU64::new(0),
            state: AtomicU8::new(CoreState::Unborn as u8),
            pending: AtomicUsize::new(0),
        }
    }
}

impl Default for CoreRecord {
    fn default() -> Self {
        Self::new()
    }
}

const SET_WORDS: usize = (MAX_CPUS + 63) / 64;

/// Everything the bootstrap core and the secondary cores exchange while
/// starting up. `repr(C)` because the boot trampoline reads `page_table` and
/// the per-core stacks.
#[repr(C)]
pub struct CoreRegistry {
    page_table: AtomicU64,
    bsp_ready: AtomicBool,
    started: [AtomicU64; SET_WORDS],
    cores: [CoreRecord; MAX_CPUS],
}

impl CoreRegistry {
    pub const fn new() -> Self {
        CoreRegistry {
            page_table: AtomicU64::new(0),
            bsp_ready: AtomicBool::new(false),
            started: [const { AtomicU64::new(0) }; SET_WORDS],
            cores: [const { CoreRecord::new() }; MAX_CPUS],
        }
    }

    fn record(&self, id: u32) -> &CoreRecord {
        assert!((id as usize) < MAX_CPUS, "core {} out of range", id);
        &self.cores[id as usize]
    }

    pub fn state(&self, id: u32) -> CoreState {
        CoreState::from_u8(self.record(id).state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, id: u32, state: CoreState) {
        self.record(id).state.store(state as u8, Ordering::Release);
    }

    /// Hands `id` its entry point and stack. Only the bootstrap core calls
    /// this, before `id` is sent INIT.
    pub fn prepare(&self, id: u32, entry: EntryFn, stack: VirtAddr) {
        let record = self.record(id);
        record.entry.store(entry as usize, Ordering::Relaxed);
        record.stack.store(stack.as_u64(), Ordering::Release);
    }

    pub fn entry(&self, id: u32) -> Option<EntryFn> {
        to_entry(self.record(id).entry.load(Ordering::Acquire))
    }

    pub fn stack(&self, id: u32) -> VirtAddr {
        VirtAddr::new(self.record(id).stack.load(Ordering::Acquire))
    }

    /// Page table root the secondary cores load before enabling paging.
    pub fn page_table(&self) -> u64 {
        self.page_table.load(Ordering::Acquire)
    }

    pub fn set_page_table(&self, root: u64) {
        self.page_table.store(root, Ordering::Release);
    }

    /// Lets secondary cores go past their startup barrier.
    pub fn release_secondaries(&self) {
        self.bsp_ready.store(true, Ordering::Release);
    }

    pub fn bsp_ready(&self) -> bool {
        self.bsp_ready.load(Ordering::Acquire)
    }

    pub fn mark_started(&self, id: u32) {
        assert!((id as usize) < MAX_CPUS, "core {} out of range", id);
        self.started[id as usize / 64].fetch_or(1 << (id % 64), Ordering::AcqRel);
    }

    /// Cores that registered themselves since the last [`CoreRegistry::reset_started`].
    pub fn started(&self) -> CpuSet {
        let mut set = CpuSet::new();
        for (word, bits) in set.bits.iter_mut().zip(self.started.iter()) {
            *word = bits.load(Ordering::Acquire);
        }
        set
    }

    pub fn reset_started(&self) {
        for bits in self.started.iter() {
            bits.store(0, Ordering::Release);
        }
    }

    /// What a secondary core does between the trampoline and its idle loop:
    /// announce itself, wait for the bootstrap core, run its entry point.
    pub fn secondary_boot(&self, id: u32) {
        self.set_state(id, CoreState::Running);
        self.mark_started(id);

        while !self.bsp_ready() {
            core::hint::spin_loop();
        }

        if let Some(entry) = self.entry(id) {
            entry();
        }
        self.settle(id);
    }

    /// Running goes back to idle. A halt that arrived meanwhile sticks.
    fn settle(&self, id: u32) {
        let _ = self.record(id).state.compare_exchange(
            CoreState::Running as u8,
            CoreState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Queues `entry` on idle core `id`.
    pub fn dispatch(&self, id: u32, entry: EntryFn) -> Result<(), DispatchError> {
        let record = self.record(id);
        if self.state(id) != CoreState::Idle {
            return Err(DispatchError::Busy);
        }
        record
            .pending
            .compare_exchange(0, entry as usize, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| DispatchError::Busy)
    }

    /// Runs work queued for `id`, if any. Called by core `id` itself.
    pub fn poll_dispatch(&self, id: u32) -> bool {
        let pending = self.record(id).pending.swap(0, Ordering::AcqRel);
        match to_entry(pending) {
            Some(entry) => {
                self.set_state(id, CoreState::Running);
                entry();
                self.settle(id);
                true
            }
            None => false,
        }
    }

    pub fn halt(&self, id: u32) {
        self.set_state(id, CoreState::Halted);
    }

    /// Where a secondary core spends its life after [`CoreRegistry::secondary_boot`].
    pub fn idle_loop(&self, id: u32) -> ! {
        loop {
            if self.state(id) == CoreState::Halted {
                crate::hlt_loop();
            }
            if !self.poll_dispatch(id) {
                core::hint::spin_loop();
            }
        }
    }
}

impl Default for CoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn to_entry(raw: usize) -> Option<EntryFn> {
    if raw == 0 {
        None
    } else {
        // Only ever stored from an `EntryFn`.
        Some(unsafe { core::mem::transmute::<usize, EntryFn>(raw) })
    }
}

/// Set of logical core ids.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet {
    bits: [u64; SET_WORDS],
}

impl CpuSet {
    pub const fn new() -> Self {
        CpuSet {
            bits: [0; SET_WORDS],
        }
    }

    pub fn insert(&mut self, id: u32) {
        assert!((id as usize) < MAX_CPUS, "core {} out of range", id);
        self.bits[id as usize / 64] |= 1 << (id % 64);
    }

    pub fn contains(&self, id: u32) -> bool {
        (id as usize) < MAX_CPUS && self.bits[id as usize / 64] & (1 << (id % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&word| word == 0)
    }

    pub fn is_superset(&self, other: &CpuSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .all(|(mine, theirs)| theirs & !mine == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_CPUS as u32).filter(move |&id| self.contains(id))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    static BOOT_RUNS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn count_boot() {
        BOOT_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    static DISPATCH_RUNS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn count_dispatch() {
        DISPATCH_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn nothing() {}

    #[test]
    fn records_start_unborn() {
        let cpus = CoreRegistry::new();
        assert_eq!(cpus.state(0), CoreState::Unborn);
        assert_eq!(cpus.state(MAX_CPUS as u32 - 1), CoreState::Unborn);
        assert!(cpus.entry(3).is_none());
        assert!(cpus.started().is_empty());
        assert!(!cpus.bsp_ready());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn ids_past_max_cpus_are_fatal() {
        CoreRegistry::new().state(MAX_CPUS as u32);
    }

    #[test]
    fn prepare_stores_entry_and_stack() {
        let cpus = CoreRegistry::new();
        cpus.prepare(2, nothing, VirtAddr::new(0xffff_8000_0010_0000));

        assert_eq!(cpus.entry(2).map(|f| f as usize), Some(nothing as usize));
        assert_eq!(cpus.stack(2).as_u64(), 0xffff_8000_0010_0000);
        assert_eq!(cpus.state(2), CoreState::Unborn);
    }

    #[test]
    fn secondary_waits_for_bootstrap_then_goes_idle() {
        let cpus = CoreRegistry::new();
        cpus.prepare(1, count_boot, VirtAddr::new(0x9000));

        std::thread::scope(|s| {
            s.spawn(|| cpus.secondary_boot(1));

            while !cpus.started().contains(1) {
                std::hint::spin_loop();
            }
            assert_eq!(cpus.state(1), CoreState::Running);
            std::thread::sleep(Duration::from_millis(2));
            assert_eq!(BOOT_RUNS.load(Ordering::SeqCst), 0);

            cpus.release_secondaries();
        });

        assert_eq!(BOOT_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(cpus.state(1), CoreState::Idle);
    }

    #[test]
    fn dispatch_only_reaches_idle_cores() {
        let cpus = CoreRegistry::new();
        assert_eq!(cpus.dispatch(4, count_dispatch), Err(DispatchError::Busy));

        cpus.set_state(4, CoreState::Idle);
        cpus.dispatch(4, count_dispatch).unwrap();
        assert_eq!(cpus.dispatch(4, nothing), Err(DispatchError::Busy));

        assert!(cpus.poll_dispatch(4));
        assert!(!cpus.poll_dispatch(4));
        assert_eq!(DISPATCH_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(cpus.state(4), CoreState::Idle);

        cpus.halt(4);
        assert_eq!(cpus.dispatch(4, nothing), Err(DispatchError::Busy));
    }

    static HALTING: CoreRegistry = CoreRegistry::new();
    extern "C" fn halt_five() {
        HALTING.halt(5);
    }
    extern "C" fn halt_six() {
        HALTING.halt(6);
    }

    #[test]
    fn halt_during_dispatched_work_sticks() {
        HALTING.set_state(5, CoreState::Idle);
        HALTING.dispatch(5, halt_five).unwrap();

        assert!(HALTING.poll_dispatch(5));
        assert_eq!(HALTING.state(5), CoreState::Halted);
        assert_eq!(HALTING.dispatch(5, nothing), Err(DispatchError::Busy));
    }

    #[test]
    fn halt_during_boot_entry_sticks() {
        HALTING.prepare(6, halt_six, VirtAddr::new(0x9000));
        HALTING.release_secondaries();

        HALTING.secondary_boot(6);
        assert_eq!(HALTING.state(6), CoreState::Halted);
    }

    #[test]
    fn started_set_tracks_registrations() {
        let cpus = CoreRegistry::new();
        for id in [1, 63, 64, 200] {
            cpus.mark_started(id);
        }
        let started = cpus.started();
        assert_eq!(started.len(), 4);
        assert_eq!(started.iter().collect::<Vec<_>>(), vec![1, 63, 64, 200]);

        cpus.reset_started();
        assert!(cpus.started().is_empty());
    }

    #[test]
    fn cpu_set_superset() {
        let mut want = CpuSet::new();
        want.insert(1);
        want.insert(70);

        let mut have = want;
        assert!(have.is_superset(&want));
        have.insert(5);
        assert!(have.is_superset(&want));
        assert!(!want.is_superset(&have));
        assert!(!have.contains(MAX_CPUS as u32));
        assert_eq!(format!("{:?}", want), "{1, 70}");
    }
}

//! Thread ready queue implementation (internal use only).
//!
//! **This module is exempt from the API stability guarantee.**
//!
//! The queue is a single intrusive list ordered by effective priority,
//! descending. Threads of equal priority keep their insertion order, which
//! is what produces round-robin behaviour at yield points.
use crate::{
    klock::{CpuLockCell, CpuLockGuard},
    thread::{ThreadCb, ThreadRef},
    utils::{
        intrusive_list::{ListAccessorCell, ListHead, UnsafeRefPool},
        Init,
    },
    KernelTraits, PortThreading,
};

pub(crate) struct ReadyQueue<Traits: PortThreading + KernelTraits> {
    /// Threads in the Ready state.
    ///
    /// Invariant: ordered by `ThreadCb::effective_priority`, descending;
    /// FIFO within one priority level.
    head: CpuLockCell<Traits, ListHead<ThreadRef<Traits>>>,
}

impl<Traits: PortThreading + KernelTraits> ReadyQueue<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            head: CpuLockCell::new(ListHead::new()),
        }
    }
}

impl<Traits: PortThreading + KernelTraits> Init for ReadyQueue<Traits> {
    const INIT: Self = Self::new();
}

/// Get a `ListAccessorCell` used to access the ready queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new(
            $head,
            // Safety: Every element of the ready queue is kept alive by
            //         the thread registry until it leaves all kernel
            //         queues.
            unsafe { UnsafeRefPool::new() },
            |cb: &ThreadCb<Traits>| &cb.sched_link,
            $key,
        )
    };
}

impl<Traits: PortThreading + KernelTraits> ReadyQueue<Traits> {
    /// Insert `thread` as close to the back as possible without violating
    /// the priority ordering. If threads of the same effective priority
    /// are present, `thread` goes after them.
    ///
    /// `thread` must not be linked in any list using
    /// [`ThreadCb::sched_link`].
    pub(crate) fn push_back_thread(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        thread: ThreadRef<Traits>,
    ) {
        // Safety: `thread` is registry-held
        let priority = unsafe { thread.0.as_ref() }.effective_priority.get(&**lock);

        let mut accessor = list_accessor!(&self.head, &mut *lock);

        // Search backwards for the last thread whose priority is not lower
        // than `priority`; the new thread goes right after it.
        let mut insert_at = None;
        let mut cursor = accessor.back();
        while let Some(at) = cursor {
            let at_priority = accessor.pool()[at]
                .effective_priority
                .get(&***accessor.cell_key());
            if at_priority < priority {
                insert_at = Some(at);
                cursor = accessor.prev(at);
            } else {
                break;
            }
        }

        accessor.insert(thread, insert_at);
    }

    /// Unlink and return the highest-priority thread, or `None` if the
    /// queue is empty.
    pub(crate) fn pop_front_thread(
        &self,
        lock: &mut CpuLockGuard<Traits>,
    ) -> Option<ThreadRef<Traits>> {
        list_accessor!(&self.head, &mut *lock).pop_front()
    }

    /// The effective priority of the thread at the front, or `None` if the
    /// queue is empty.
    pub(crate) fn front_priority(&self, lock: &mut CpuLockGuard<Traits>) -> Option<u8> {
        let accessor = list_accessor!(&self.head, &mut *lock);
        accessor
            .front_data()
            .map(|cb| cb.effective_priority.get(&***accessor.cell_key()))
    }

    /// Unlink `thread`, which must be linked in this queue.
    pub(crate) fn remove_thread(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        thread: ThreadRef<Traits>,
    ) {
        list_accessor!(&self.head, &mut *lock).remove(thread);
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cooperative round-robin run queue
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (enqueue/remove/yield_current/schedule_next/current)
//! INVARIANTS: An id appears at most once in the queue; the current environment is not
//!             queued; the scheduler never crosses thread boundaries

extern crate alloc;

use alloc::collections::VecDeque;
use core::marker::PhantomData;

use crate::types::EnvId;

/// Single-processor round-robin scheduler.
///
/// `Scheduler` is `!Send` and `!Sync`: it is owned by the kernel and only mutated on the
/// syscall/trap path.
pub struct Scheduler {
    queue: VecDeque<EnvId>,
    current: Option<EnvId>,
    _not_send_sync: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(Scheduler: Send, Sync);

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self { queue: VecDeque::new(), current: None, _not_send_sync: PhantomData }
    }

    /// Appends `id` to the run queue unless it is already queued or running.
    pub fn enqueue(&mut self, id: EnvId) {
        if self.current == Some(id) || self.queue.contains(&id) {
            return;
        }
        self.queue.push_back(id);
    }

    /// Drops `id` from the run queue.
    pub fn remove(&mut self, id: EnvId) {
        self.queue.retain(|queued| *queued != id);
        if self.current == Some(id) {
            self.current = None;
        }
    }

    pub fn current(&self) -> Option<EnvId> {
        self.current
    }

    /// Makes `id` the running environment, taking it off the queue.
    pub fn set_current(&mut self, id: Option<EnvId>) {
        if let Some(id) = id {
            self.queue.retain(|queued| *queued != id);
        }
        self.current = id;
    }

    /// Moves the running environment to the back of the queue.
    pub fn yield_current(&mut self) {
        if let Some(id) = self.current.take() {
            self.queue.push_back(id);
        }
    }

    /// Picks the next environment to run.
    pub fn schedule_next(&mut self) -> Option<EnvId> {
        let next = self.queue.pop_front()?;
        self.current = Some(next);
        Some(next)
    }

    pub fn is_queued(&self, id: EnvId) -> bool {
        self.queue.contains(&id)
    }

    /// Queued environments in dispatch order.
    pub fn queued(&self) -> impl Iterator<Item = EnvId> + '_ {
        self.queue.iter().copied()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

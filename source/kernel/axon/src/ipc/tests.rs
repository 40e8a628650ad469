// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Unit tests for the rendezvous IPC state machine
//! OWNERS: @kernel-ipc-team
//! NOTE: Tests only; drive try_send/recv directly against an EnvTable

use axon_abi::{EnvStatus, Perm};

use super::{recv, try_send, IpcError, SendRequest};
use crate::env::{EnvError, EnvTable};
use crate::mm::FramePool;
use crate::sched::Scheduler;
use crate::types::{EnvId, VirtAddr};

struct World {
    envs: EnvTable,
    pool: FramePool,
    scheduler: Scheduler,
}

impl World {
    fn new() -> Self {
        Self { envs: EnvTable::new(4), pool: FramePool::new(32), scheduler: Scheduler::new() }
    }

    fn spawn(&mut self) -> EnvId {
        self.envs.alloc(&self.pool, None).unwrap()
    }

    fn send(&mut self, from: EnvId, req: SendRequest) -> Result<(), IpcError> {
        try_send(&mut self.envs, &self.pool, &mut self.scheduler, from, &req)
    }

    fn map_fresh(&mut self, env: EnvId, va: usize, perm: Perm, byte: u8) {
        let frame = self.pool.alloc().unwrap();
        frame.write(0, &[byte]);
        let va = VirtAddr::user_page(va).unwrap();
        self.envs.get_mut(env).unwrap().space_mut().map(&self.pool, &frame, va, perm).unwrap();
    }
}

fn ur() -> Perm {
    Perm::PRESENT | Perm::USER
}

#[test]
fn send_without_receiver_has_no_side_effects() {
    let mut world = World::new();
    let x = world.spawn();
    let y = world.spawn();
    let before = *world.envs.get(x).unwrap().mailbox();

    let req = SendRequest { target: x, value: 42, page: None };
    assert_eq!(world.send(y, req), Err(IpcError::NotReceiving));
    let env = world.envs.get(x).unwrap();
    assert_eq!(*env.mailbox(), before);
    assert_eq!(env.status(), EnvStatus::NotRunnable);
}

#[test]
fn scalar_message_wakes_the_receiver() {
    let mut world = World::new();
    let x = world.spawn();
    let y = world.spawn();
    recv(&mut world.envs, &mut world.scheduler, x, None).unwrap();
    assert!(world.envs.get(x).unwrap().mailbox().is_receiving());

    world.send(y, SendRequest { target: x, value: 42, page: None }).unwrap();

    let env = world.envs.get(x).unwrap();
    assert!(!env.mailbox().is_receiving());
    assert_eq!(env.mailbox().from(), y);
    assert_eq!(env.mailbox().value(), 42);
    assert_eq!(env.mailbox().perm(), Perm::empty());
    assert_eq!(env.frame().ret(), 0);
    assert_eq!(env.status(), EnvStatus::Runnable);
    assert!(world.scheduler.is_queued(x));

    // The rendezvous is consumed; a second sender finds no receiver.
    let again = world.send(y, SendRequest { target: x, value: 43, page: None });
    assert_eq!(again, Err(IpcError::NotReceiving));
    assert_eq!(world.envs.get(x).unwrap().mailbox().value(), 42);
}

#[test]
fn page_transfer_shares_the_frame() {
    let mut world = World::new();
    let x = world.spawn();
    let y = world.spawn();
    world.map_fresh(y, 0x0080_0000, ur() | Perm::WRITABLE, 0x5a);
    let dst = VirtAddr::user_page(0x00a0_0000).unwrap();
    recv(&mut world.envs, &mut world.scheduler, x, Some(dst)).unwrap();

    let page = Some((VirtAddr::user_page(0x0080_0000).unwrap(), ur()));
    world.send(y, SendRequest { target: x, value: 1, page }).unwrap();

    let (received, perm) = world.envs.get(x).unwrap().space().lookup(dst).unwrap();
    let src = VirtAddr::user_page(0x0080_0000).unwrap();
    let (sent, _) = world.envs.get(y).unwrap().space().lookup(src).unwrap();
    assert!(received.same_frame(sent));
    assert_eq!(received.ref_count(), 2);
    assert_eq!(perm, ur());
    assert_eq!(world.envs.get(x).unwrap().mailbox().perm(), ur());
    let mut byte = [0_u8];
    received.read(0, &mut byte);
    assert_eq!(byte, [0x5a]);
}

#[test]
fn page_is_dropped_when_receiver_wants_none() {
    let mut world = World::new();
    let x = world.spawn();
    let y = world.spawn();
    world.map_fresh(y, 0x0080_0000, ur(), 1);
    recv(&mut world.envs, &mut world.scheduler, x, None).unwrap();

    let page = Some((VirtAddr::user_page(0x0080_0000).unwrap(), ur()));
    world.send(y, SendRequest { target: x, value: 9, page }).unwrap();

    let env = world.envs.get(x).unwrap();
    assert_eq!(env.mailbox().perm(), Perm::empty());
    assert_eq!(env.space().mapped_pages(), 0);
}

#[test]
fn bad_source_page_leaves_receiver_waiting() {
    let mut world = World::new();
    let x = world.spawn();
    let y = world.spawn();
    world.map_fresh(y, 0x0080_0000, ur(), 1);
    let dst = VirtAddr::user_page(0x00a0_0000).unwrap();
    recv(&mut world.envs, &mut world.scheduler, x, Some(dst)).unwrap();

    let unmapped = Some((VirtAddr::user_page(0x0090_0000).unwrap(), ur()));
    let escalate = Some((VirtAddr::user_page(0x0080_0000).unwrap(), ur() | Perm::WRITABLE));
    for page in [unmapped, escalate] {
        let result = world.send(y, SendRequest { target: x, value: 5, page });
        assert_eq!(result, Err(IpcError::InvalidSource));
    }
    let env = world.envs.get(x).unwrap();
    assert!(env.mailbox().is_receiving());
    assert_eq!(env.status(), EnvStatus::NotRunnable);
    assert_eq!(env.space().mapped_pages(), 0);
}

#[test]
fn unknown_target_is_bad_env() {
    let mut world = World::new();
    let y = world.spawn();
    let ghost = EnvId::new(7, 3);
    let result = world.send(y, SendRequest { target: ghost, value: 0, page: None });
    assert_eq!(result, Err(IpcError::Env(EnvError::BadEnv)));
}

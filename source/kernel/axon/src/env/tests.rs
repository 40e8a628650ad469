// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Unit tests for the environment registry
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; verify id resolution rules, generation checks and teardown accounting

use axon_abi::EnvStatus;

use super::{EnvError, EnvId, EnvTable, Requester};
use crate::mm::{FramePool, Perm};
use crate::sched::Scheduler;
use crate::types::VirtAddr;

fn setup(slots: usize) -> (EnvTable, FramePool) {
    (EnvTable::new(slots), FramePool::new(32))
}

#[test]
fn self_sentinel_names_the_requester() {
    let (mut envs, pool) = setup(4);
    let a = envs.alloc(&pool, None).unwrap();
    assert_eq!(envs.resolve(EnvId::SELF, Requester::Env(a), true), Ok(a));
    assert_eq!(envs.resolve(EnvId::SELF, Requester::Kernel, false), Err(EnvError::BadEnv));
}

#[test]
fn permission_admits_self_and_parent_only() {
    let (mut envs, pool) = setup(4);
    let parent = envs.alloc(&pool, None).unwrap();
    let child = envs.alloc(&pool, Some(parent)).unwrap();
    let stranger = envs.alloc(&pool, None).unwrap();

    assert_eq!(envs.resolve(child, Requester::Env(parent), true), Ok(child));
    assert_eq!(envs.resolve(child, Requester::Env(child), true), Ok(child));
    assert_eq!(envs.resolve(child, Requester::Env(stranger), true), Err(EnvError::BadEnv));
    // A child may not act on its parent.
    assert_eq!(envs.resolve(parent, Requester::Env(child), true), Err(EnvError::BadEnv));
    // Without the permission check anyone may name anyone.
    assert_eq!(envs.resolve(child, Requester::Env(stranger), false), Ok(child));
    assert_eq!(envs.resolve(child, Requester::Kernel, true), Ok(child));
}

#[test]
fn stale_ids_do_not_resolve_after_reuse() {
    let (mut envs, pool) = setup(1);
    let mut scheduler = Scheduler::new();
    let first = envs.alloc(&pool, None).unwrap();
    envs.destroy(first, &mut scheduler).unwrap();
    let second = envs.alloc(&pool, None).unwrap();

    assert_eq!(first.index(), second.index());
    assert_ne!(first, second);
    assert_eq!(envs.resolve(first, Requester::Kernel, false), Err(EnvError::BadEnv));
    assert_eq!(envs.resolve(second, Requester::Kernel, false), Ok(second));
}

#[test]
fn full_table_reports_no_free_env() {
    let (mut envs, pool) = setup(2);
    envs.alloc(&pool, None).unwrap();
    envs.alloc(&pool, None).unwrap();
    assert_eq!(envs.alloc(&pool, None), Err(EnvError::NoFreeEnv));
}

#[test]
fn alloc_without_root_frame_reports_no_memory() {
    let mut envs = EnvTable::new(2);
    let pool = FramePool::new(1);
    envs.alloc(&pool, None).unwrap();
    assert_eq!(envs.alloc(&pool, None), Err(EnvError::NoMemory));
    assert_eq!(envs.len(), 1);
}

#[test]
fn new_envs_start_not_runnable_with_empty_space() {
    let (mut envs, pool) = setup(2);
    let id = envs.alloc(&pool, None).unwrap();
    let env = envs.get(id).unwrap();
    assert_eq!(env.status(), EnvStatus::NotRunnable);
    assert_eq!(env.space().mapped_pages(), 0);
    assert_eq!(env.pgfault_upcall(), None);
    assert!(!env.mailbox().is_receiving());
}

#[test]
fn destroy_releases_frames_and_dequeues() {
    let (mut envs, pool) = setup(2);
    let mut scheduler = Scheduler::new();
    let id = envs.alloc(&pool, None).unwrap();
    let frame = pool.alloc().unwrap();
    let va = VirtAddr::user_page(0x0080_0000).unwrap();
    envs.get_mut(id)
        .unwrap()
        .space_mut()
        .map(&pool, &frame, va, Perm::PRESENT | Perm::USER)
        .unwrap();
    scheduler.enqueue(id);
    assert_eq!(frame.ref_count(), 2);

    envs.destroy(id, &mut scheduler).unwrap();
    assert_eq!(frame.ref_count(), 1);
    assert!(!scheduler.is_queued(id));
    assert_eq!(envs.get(id).map(|_| ()), Err(EnvError::BadEnv));
    assert_eq!(envs.destroy(id, &mut scheduler), Err(EnvError::BadEnv));
}

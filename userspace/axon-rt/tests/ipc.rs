// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for rendezvous IPC through the user runtime
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 4 integration tests
//!
//! TEST_SCENARIOS:
//!   - forty_two(): scalar message wakes the receiver with sender, value and empty perm
//!   - send_before_receive_changes_nothing(): IpcNotRecv leaves the target untouched
//!   - page_transfer_shares_the_frame(): receiver sees the sender's frame at its address
//!   - parent_and_forked_child_talk(): fork then ping the child over IPC
//!
//! DEPENDENCIES:
//!   - axon::Kernel: emulated machine

use core::task::Poll;

use axon::types::VirtAddr;
use axon::{Kernel, KernelConfig, ProgramImage};
use axon_abi::{EnvStatus, Errno, Perm, PAGE_SIZE, UTEXT};
use axon_rt::{fork, ipc, Message, Process};

const SHARE: usize = 0x2000_0000;

fn spawn(kernel: &mut Kernel) -> Process {
    let image = ProgramImage { text: &[0x13; 16], data: &[0; 16], bss: 0 };
    Process::from_spawned(&kernel.spawn(&image).unwrap())
}

#[test]
fn forty_two() {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    let x = spawn(&mut kernel);
    let y = spawn(&mut kernel);

    let mut pending = ipc::recv(&x, &mut kernel, None).unwrap();
    assert_eq!(kernel.env(x.env_id()).unwrap().status(), EnvStatus::NotRunnable);
    assert_eq!(pending.poll(&kernel), Poll::Pending);

    ipc::try_send(&y, &mut kernel, x.env_id(), 42, None).unwrap();

    let env = kernel.env(x.env_id()).unwrap();
    assert_eq!(env.status(), EnvStatus::Runnable);
    assert_eq!(env.frame().ret(), 0);
    assert_eq!(
        pending.poll(&kernel),
        Poll::Ready(Ok(Message { from: y.env_id(), value: 42, perm: Perm::empty() }))
    );
}

#[test]
fn send_before_receive_changes_nothing() {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    let x = spawn(&mut kernel);
    let y = spawn(&mut kernel);
    let mailbox = *kernel.env(x.env_id()).unwrap().mailbox();
    let status = kernel.env(x.env_id()).unwrap().status();

    let data = UTEXT + PAGE_SIZE;
    let rw = Perm::USER_PRESENT | Perm::WRITABLE;
    assert_eq!(
        ipc::try_send(&y, &mut kernel, x.env_id(), 42, Some((data, rw))),
        Err(Errno::IpcNotRecv)
    );
    let env = kernel.env(x.env_id()).unwrap();
    assert_eq!(*env.mailbox(), mailbox);
    assert_eq!(env.status(), status);
}

#[test]
fn page_transfer_shares_the_frame() {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    let mut x = spawn(&mut kernel);
    let mut y = spawn(&mut kernel);
    let data = UTEXT + PAGE_SIZE;
    y.write(&mut kernel, data, b"hello").unwrap();

    let mut pending = ipc::recv(&x, &mut kernel, Some(SHARE)).unwrap();
    ipc::send(&y, &mut kernel, x.env_id(), 7, Some((data, Perm::USER_PRESENT))).unwrap();
    let Poll::Ready(Ok(message)) = pending.poll(&kernel) else {
        panic!("receive did not complete");
    };
    assert_eq!(message.perm, Perm::USER_PRESENT);

    let frame = |process: &Process, va| {
        let env = kernel.env(process.env_id()).unwrap();
        env.space().lookup(VirtAddr::user_page(va).unwrap()).unwrap().0.pfn()
    };
    assert_eq!(frame(&x, SHARE), frame(&y, data));

    let mut text = [0_u8; 5];
    x.read(&mut kernel, SHARE, &mut text).unwrap();
    assert_eq!(&text, b"hello");
    // Read-only for the receiver, still writable for the sender.
    assert_eq!(x.query(&mut kernel, SHARE), Some(Perm::USER_PRESENT));
    y.write(&mut kernel, data, b"J").unwrap();
    x.read(&mut kernel, SHARE, &mut text).unwrap();
    assert_eq!(&text, b"Jello");
}

#[test]
fn parent_and_forked_child_talk() {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    let mut parent = spawn(&mut kernel);
    let child = fork(&mut parent, &mut kernel).unwrap().resume(&mut kernel).unwrap();

    let mut pending = ipc::recv(&child, &mut kernel, None).unwrap();
    ipc::send(&parent, &mut kernel, child.this_env(), 0xbeef, None).unwrap();
    assert_eq!(
        pending.poll(&kernel),
        Poll::Ready(Ok(Message { from: parent.env_id(), value: 0xbeef, perm: Perm::empty() }))
    );
}

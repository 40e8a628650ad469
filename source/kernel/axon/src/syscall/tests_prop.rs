// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for syscall argument validation
//! OWNERS: @kernel-team
//! NOTE: Tests only; no kernel logic. Random register values must never change mappings
//!       unless they form a valid request.
//!
//! TEST_SCOPE:
//!   - Rejected page requests leave the address space and frame pool untouched
//!   - Accepted permissions are exactly the user-settable subset
//!   - page_map never grants W on a read-only source

use axon_abi::{
    Errno, Perm, PAGE_SIZE, SYSCALL_PAGE_ALLOC, SYSCALL_PAGE_MAP, SYSCALL_PAGE_UNMAP, UTEXT, UTOP,
};
use proptest::prelude::*;

use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::loader::ProgramImage;
use crate::trap::Ecall;
use crate::types::{EnvId, VirtAddr};

fn boot() -> (Kernel, EnvId) {
    let mut kernel = Kernel::new(KernelConfig::new(64, 4)).unwrap();
    let image = ProgramImage { text: &[0; 8], data: &[1; 8], bss: 0 };
    let id = kernel.spawn(&image).unwrap().id;
    (kernel, id)
}

fn sys(kernel: &mut Kernel, id: EnvId, number: usize, args: [usize; 5]) -> Result<usize, Errno> {
    match kernel.cpu(id).unwrap().ecall(number, args) {
        Ecall::Returned(ret) => Errno::decode(ret),
        other => panic!("unexpected {other:?}"),
    }
}

fn snapshot(kernel: &Kernel, id: EnvId) -> (Vec<(usize, Perm)>, usize) {
    let mappings = kernel
        .env(id)
        .unwrap()
        .space()
        .mappings()
        .map(|(va, perm)| (va.raw(), perm))
        .collect();
    (mappings, kernel.frames().used_frames())
}

fn arb_bad_va() -> impl Strategy<Value = usize> {
    prop_oneof![
        UTOP..=usize::MAX,
        (0usize..UTOP).prop_filter("unaligned", |va| va % PAGE_SIZE != 0),
    ]
}

fn arb_user_va() -> impl Strategy<Value = usize> {
    (0usize..UTOP / PAGE_SIZE).prop_map(|page| page * PAGE_SIZE)
}

fn arb_perm_bits() -> impl Strategy<Value = usize> {
    prop_oneof![(0u32..0x1000).prop_map(|bits| bits as usize), any::<usize>()]
}

proptest! {
    #[test]
    fn bad_addresses_are_inval_and_change_nothing(va in arb_bad_va(), perm in arb_perm_bits()) {
        let (mut kernel, id) = boot();
        let before = snapshot(&kernel, id);
        let alloc = sys(&mut kernel, id, SYSCALL_PAGE_ALLOC, [0, va, perm, 0, 0]);
        prop_assert_eq!(alloc, Err(Errno::Inval));
        let unmap = sys(&mut kernel, id, SYSCALL_PAGE_UNMAP, [0, va, 0, 0, 0]);
        prop_assert_eq!(unmap, Err(Errno::Inval));
        let map = sys(&mut kernel, id, SYSCALL_PAGE_MAP, [0, UTEXT, 0, va, perm]);
        prop_assert_eq!(map, Err(Errno::Inval));
        prop_assert_eq!(snapshot(&kernel, id), before);
    }

    #[test]
    fn accepted_perms_are_user_settable(va in arb_user_va(), perm in arb_perm_bits()) {
        let (mut kernel, id) = boot();
        let before = snapshot(&kernel, id);
        let result = sys(&mut kernel, id, SYSCALL_PAGE_ALLOC, [0, va, perm, 0, 0]);
        let settable = Perm::from_raw(perm).is_some_and(Perm::is_user_settable);
        if settable {
            prop_assert_eq!(result, Ok(0));
            let page = VirtAddr::user_page(va).unwrap();
            let installed = kernel.env(id).unwrap().space().perm(page);
            prop_assert_eq!(installed, Perm::from_raw(perm));
        } else {
            prop_assert_eq!(result, Err(Errno::Inval));
            prop_assert_eq!(snapshot(&kernel, id), before);
        }
    }

    #[test]
    fn read_only_sources_never_become_writable(dst in arb_user_va(), extra in 0u32..0x1000) {
        let perm = (Perm::from_bits_truncate(extra) & Perm::SYSCALL) | Perm::USER_PRESENT;
        let (mut kernel, id) = boot();
        let before = snapshot(&kernel, id);
        let args = [0, UTEXT, 0, dst, perm.bits() as usize];
        let result = sys(&mut kernel, id, SYSCALL_PAGE_MAP, args);
        if perm.contains(Perm::WRITABLE) {
            prop_assert_eq!(result, Err(Errno::Inval));
            prop_assert_eq!(snapshot(&kernel, id), before);
        } else {
            prop_assert_eq!(result, Ok(0));
        }
    }
}

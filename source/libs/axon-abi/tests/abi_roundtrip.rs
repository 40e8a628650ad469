//! CONTEXT: Wire-layout and errno checks for the axon ABI
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 4 unit tests
//!
//! TEST_SCENARIOS:
//!   - exception_record_matches(): UTrapframe survives LE encoding
//!   - errno_decodes_negative_returns(): raw returns split into value / Errno
//!   - syscall_perm_mask(): settable-permission predicate
//!   - env_ids_never_collide_with_self(): generation wrap skips zero
use axon_abi::{
    EnvId, Errno, FaultCode, Perm, TrapFrame, UTrapframe, ENVGENSHIFT, REG_A0, REG_SP,
};

#[test]
fn exception_record_matches() {
    let mut regs = TrapFrame::default();
    regs.x[REG_SP] = 0xeebf_dff0;
    regs.x[REG_A0] = 7;
    regs.sepc = 0x0080_0020;
    let record = UTrapframe {
        fault_va: 0x0080_1004,
        err: FaultCode::WRITE | FaultCode::USER | FaultCode::PRESENT,
        regs,
    };
    assert_eq!(UTrapframe::from_le_bytes(&record.to_le_bytes()), record);
    assert_eq!(UTrapframe::SIZE, 288);
}

#[test]
fn errno_decodes_negative_returns() {
    assert_eq!(Errno::decode(5), Ok(5));
    assert_eq!(Errno::decode(Errno::IpcNotRecv.as_ret()), Err(Errno::IpcNotRecv));
    assert_eq!(Errno::decode(Errno::BadEnv.as_ret()), Err(Errno::BadEnv));
    assert_eq!(Errno::decode(-99), Err(Errno::Inval));
}

#[test]
fn syscall_perm_mask() {
    let base = Perm::PRESENT | Perm::USER;
    assert!(base.is_user_settable());
    assert!((base | Perm::WRITABLE).is_user_settable());
    assert!((base | Perm::COW).is_user_settable());
    assert!(!Perm::PRESENT.is_user_settable());
    assert!(!(base | Perm::DIRTY).is_user_settable());
    assert_eq!(Perm::from_raw(0x1000), None);
    assert_eq!(Perm::from_raw(0x807), Some(base | Perm::WRITABLE | Perm::COW));
}

#[test]
fn env_ids_never_collide_with_self() {
    let max_generation = u32::MAX >> ENVGENSHIFT;
    assert_eq!(EnvId::next_generation(max_generation), 1);
    let id = EnvId::new(EnvId::next_generation(max_generation), 0);
    assert!(!id.is_self());
    assert_eq!(id.index(), 0);
    assert_eq!(EnvId::new(3, 17).generation(), 3);
}

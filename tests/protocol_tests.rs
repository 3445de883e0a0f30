//! Object-protocol tests against the in-memory mock target: full
//! transfers, resume, checkpoint retries, and failure propagation.

mod mockdfu;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mockdfu::MockTarget;
use nrfdfu::dfu::{DfuTarget, DfuTransport, ExtError, ObjectClass, OpCode, ResultCode};
use nrfdfu::error::Error;

const OBJ: usize = 4096;

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(7) ^ (i >> 8)) as u8).collect()
}

fn init_packet() -> Vec<u8> {
    (0..80u8).map(|i| i.wrapping_mul(3)).collect()
}

fn target(mock: MockTarget) -> DfuTarget<MockTarget> {
    let mut t = DfuTarget::new(mock);
    t.set_timeout(Duration::from_millis(50));
    t
}

#[test]
fn full_transfer_commits_firmware() {
    let fw = firmware(3 * OBJ);
    let init = init_packet();

    let mut t = target(MockTarget::new());
    t.send_init_packet(&init).unwrap();
    t.send_firmware(&fw).unwrap();

    let mock = t.transport_mut();
    assert_eq!(mock.executed_inits, vec![init]);
    assert_eq!(mock.committed_firmware(), fw.as_slice());
    // One command object plus three data objects.
    assert_eq!(mock.count_ops(OpCode::ObjectCreate), 4);
}

#[test]
fn uneven_tail_object_is_sized_exactly() {
    let fw = firmware(2 * OBJ + 100);
    let mut t = target(MockTarget::new());
    t.send_firmware(&fw).unwrap();
    let mock = t.transport_mut();
    assert_eq!(mock.committed_firmware(), fw.as_slice());
    assert_eq!(mock.count_ops(OpCode::ObjectCreate), 3);
}

#[test]
fn checkpoint_cadence_follows_prn() {
    let fw = firmware(3 * OBJ);
    let mut t = target(MockTarget::new());
    t.set_prn_interval(4);
    t.send_firmware(&fw).unwrap();

    // 64 fragments per object: 15 mid-object checkpoints (none at the
    // object end) plus the final verification, times three objects.
    assert_eq!(t.transport_mut().count_ops(OpCode::CrcGet), 48);
}

#[test]
fn prn_zero_checkpoints_only_at_object_end() {
    let fw = firmware(3 * OBJ);
    let mut t = target(MockTarget::new());
    t.set_prn_interval(0);
    t.send_firmware(&fw).unwrap();
    assert_eq!(t.transport_mut().count_ops(OpCode::CrcGet), 3);
}

#[test]
fn resume_skips_committed_objects() {
    let fw = firmware(3 * OBJ);
    let mut mock = MockTarget::new();
    mock.preload_data(fw[..OBJ].to_vec(), OBJ, OBJ as u32);

    let mut t = target(mock);
    t.send_firmware(&fw).unwrap();
    let mock = t.transport_mut();
    assert_eq!(mock.committed_firmware(), fw.as_slice());
    // Only the two remaining objects were created.
    assert_eq!(mock.count_ops(OpCode::ObjectCreate), 2);
}

#[test]
fn resume_completes_partial_object_without_create() {
    let fw = firmware(3 * OBJ);
    let mut mock = MockTarget::new();
    // 4096 committed plus 1904 streamed into the second object.
    mock.preload_data(fw[..6000].to_vec(), OBJ, OBJ as u32);

    let mut t = target(mock);
    t.send_firmware(&fw).unwrap();
    let mock = t.transport_mut();
    assert_eq!(mock.committed_firmware(), fw.as_slice());
    // The part-filled object is finished in place; only the third is
    // created.
    assert_eq!(mock.count_ops(OpCode::ObjectCreate), 1);
}

#[test]
fn resume_executes_boundary_object_before_continuing() {
    let fw = firmware(3 * OBJ);
    let mut mock = MockTarget::new();
    // The second object was fully streamed but the transfer died
    // before its execute; a create here would discard it.
    mock.preload_data(fw[..2 * OBJ].to_vec(), OBJ, OBJ as u32);

    let mut t = target(mock);
    t.send_firmware(&fw).unwrap();
    let mock = t.transport_mut();
    assert_eq!(mock.committed_firmware(), fw.as_slice());
    // The streamed object is executed in place; only the third is
    // created.
    assert_eq!(mock.count_ops(OpCode::ObjectCreate), 1);
}

#[test]
fn mismatched_prefix_restarts_from_object_boundary() {
    let fw = firmware(3 * OBJ);
    let mut stored = fw[..6000].to_vec();
    stored[5000] ^= 0xFF;
    let mut mock = MockTarget::new();
    mock.preload_data(stored, OBJ, OBJ as u32);

    let mut t = target(mock);
    t.send_firmware(&fw).unwrap();
    let mock = t.transport_mut();
    assert_eq!(mock.committed_firmware(), fw.as_slice());
    // The corrupted partial object is recreated, then the third.
    assert_eq!(mock.count_ops(OpCode::ObjectCreate), 2);
}

#[test]
fn dropped_fragment_retries_the_object() {
    let fw = firmware(3 * OBJ);
    let mut mock = MockTarget::new();
    mock.faults.drop_fragments = vec![2];

    let retries = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&retries);
    let mut t = target(mock);
    t.set_prn_interval(0);
    t.on_error(move |_| {
        seen.fetch_add(1, Ordering::Relaxed);
    });
    t.send_firmware(&fw).unwrap();

    let mock = t.transport_mut();
    assert_eq!(mock.committed_firmware(), fw.as_slice());
    assert_eq!(mock.count_ops(OpCode::ObjectCreate), 4);
    assert_eq!(retries.load(Ordering::Relaxed), 1);
}

#[test]
fn exhausted_retry_budget_fails_the_transfer() {
    let fw = firmware(OBJ);
    let mut mock = MockTarget::new();
    // Sabotage every attempt at the first object: 64 fragments per
    // pass, one dropped per pass.
    mock.faults.drop_fragments = vec![0, 64, 128];

    let mut t = target(mock);
    t.set_prn_interval(0);
    let err = t.send_firmware(&fw).unwrap_err();
    assert!(matches!(err, Error::TransferFailed));
}

#[test]
fn oversized_init_packet_is_rejected() {
    let init = vec![0xAB; 300];
    let mut t = target(MockTarget::new());
    let err = t.send_init_packet(&init).unwrap_err();
    match err {
        Error::InitTooLong { len, max } => {
            assert_eq!(len, 300);
            assert_eq!(max, 256);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn init_extended_error_propagates() {
    let mut mock = MockTarget::new();
    mock.faults.init_ext_error = Some(0x08);

    let mut t = target(mock);
    let err = t.send_init_packet(&init_packet()).unwrap_err();
    match err {
        Error::Response { result, ext } => {
            assert_eq!(result, ResultCode::ExtError);
            assert_eq!(ext, Some(ExtError::SignatureMissing));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn init_checkpoint_mismatch_gets_one_retry() {
    let init = init_packet();
    let mut mock = MockTarget::new();
    mock.faults.corrupt_data_at = Some(10);

    let mut t = target(mock);
    t.send_init_packet(&init).unwrap();
    let mock = t.transport_mut();
    assert_eq!(mock.executed_inits, vec![init]);
    assert_eq!(mock.count_ops(OpCode::ObjectCreate), 2);
}

#[test]
fn matching_init_already_on_target_is_just_executed() {
    let init = init_packet();
    let mut mock = MockTarget::new();
    mock.preload_command(init.clone(), 256);

    let mut t = target(mock);
    t.send_init_packet(&init).unwrap();
    let mock = t.transport_mut();
    assert_eq!(mock.executed_inits, vec![init]);
    assert_eq!(mock.count_ops(OpCode::ObjectCreate), 0);
}

#[test]
fn timeout_fires_event_and_closes_transport() {
    let mut mock = MockTarget::new();
    mock.faults.swallow_responses = 1;

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let mut t = target(mock);
    t.on_timeout(move || flag.store(true, Ordering::Relaxed));

    let err = t.select(ObjectClass::Data).unwrap_err();
    assert!(matches!(err, Error::OperationTimeout));
    assert!(fired.load(Ordering::Relaxed));
    assert_eq!(t.transport_mut().close_calls, 1);
}

#[test]
fn progress_reaches_total() {
    let fw = firmware(OBJ + 100);
    let last = Arc::new(AtomicUsize::new(0));
    let total_seen = Arc::new(AtomicUsize::new(0));
    let (l, ts) = (Arc::clone(&last), Arc::clone(&total_seen));

    let mut t = target(MockTarget::new());
    t.on_progress(move |sent, total| {
        l.store(sent as usize, Ordering::Relaxed);
        ts.store(total as usize, Ordering::Relaxed);
    });
    t.send_firmware(&fw).unwrap();

    assert_eq!(last.load(Ordering::Relaxed), OBJ + 100);
    assert_eq!(total_seen.load(Ordering::Relaxed), OBJ + 100);
}

#[test]
fn ping_echoes_id() {
    let mut t = target(MockTarget::new());
    assert!(t.ping(0x2A).unwrap());
}

#[test]
fn transport_trait_is_object_safe() {
    // The CLI stores transports behind the trait; keep it that way.
    fn assert_dyn(_: &dyn DfuTransport) {}
    let mock = MockTarget::new();
    assert_dyn(&mock);
}

#[test]
fn version_readout_parses_hw_and_fw() {
    use nrfdfu::dfu::FirmwareType;

    let mut t = target(MockTarget::new());
    let hw = t.hw_version().unwrap();
    assert_eq!(hw.part, 0x52840);
    assert_eq!(hw.rom_page_size, 4096);
    assert_eq!(hw.rom_size, 1024 * 1024);

    let slot0 = t.fw_version(0).unwrap();
    assert_eq!(slot0.fw_type, FirmwareType::Application);
    assert_eq!(slot0.version, 3);
    assert_eq!(slot0.addr, 0x1000);

    let slot1 = t.fw_version(1).unwrap();
    assert!(matches!(slot1.fw_type, FirmwareType::Unknown(0xFF)));
}

mod common;

use std::cell::RefCell;

use common::*;

use stm32_uart_loader::protocol::FLASH_BASE;
use stm32_uart_loader::{
    decode, CancelToken, EraseKind, EraseMode, Error, FlashError, FlashOptions, Flasher, Format, MemorySegment, Phase,
    ProgressEvent, State,
};

fn skip_erase() -> FlashOptions {
    FlashOptions { erase: EraseMode::Skip, verify: false, run: false, page_size: None }
}

#[test]
fn flash_verify_and_run() {
    let port = SimPort::new(SimConfig::extended());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let a = pattern(600, 1);
    let b = pattern(100, 2);
    let segments = vec![MemorySegment::new(FLASH_BASE, a.clone()), MemorySegment::new(FLASH_BASE + 0x1000, b.clone())];

    let events = RefCell::new(vec![]);
    Flasher::new(&mut p)
        .with_observer(|e: ProgressEvent| events.borrow_mut().push(e))
        .flash(&segments, &FlashOptions::default())
        .unwrap();

    assert_eq!(port.flash(FLASH_BASE, 600), a);
    assert_eq!(port.flash(FLASH_BASE + 0x1000, 100), b);

    let sim = port.sim();
    assert_eq!(sim.erases, vec![EraseKind::Global]);
    assert_eq!(
        sim.writes,
        vec![(FLASH_BASE, 256), (FLASH_BASE + 256, 256), (FLASH_BASE + 512, 88), (FLASH_BASE + 0x1000, 100)]
    );
    assert_eq!(sim.reads.len(), 4);
    assert_eq!(sim.jumped, Some(FLASH_BASE));
    drop(sim);

    assert_eq!(p.state(), State::Disconnected);

    let events = events.into_inner();
    let last_write = events.iter().filter(|e| e.phase == Phase::Write).last().unwrap();
    assert_eq!((last_write.bytes_done, last_write.bytes_total), (700, 700));
    assert!(events.iter().any(|e| e.phase == Phase::Erase));
    assert!(events.iter().any(|e| e.phase == Phase::Verify && e.bytes_done == 700));
}

#[test]
fn flash_from_intel_hex() {
    let text = ":020000040800F2\n:10000000000102030405060708090A0B0C0D0E0F78\n:00000001FF\n";
    let segments = decode(text.as_bytes(), Format::IntelHex, 0).unwrap();

    let port = SimPort::new(SimConfig::extended());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let options = FlashOptions { run: false, ..FlashOptions::default() };
    Flasher::new(&mut p).flash(&segments, &options).unwrap();

    assert_eq!(port.flash(FLASH_BASE, 16), (0..16).collect::<Vec<u8>>());
    assert_eq!(port.sim().jumped, None);
    assert_eq!(p.state(), State::Ready);
}

#[test]
fn rejected_chunk_aborts_flash() {
    let port = SimPort::new(SimConfig { nack_write: Some(2), ..SimConfig::extended() });
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let segments = vec![MemorySegment::new(FLASH_BASE, pattern(1024, 3))];
    let err = Flasher::new(&mut p).flash(&segments, &FlashOptions::default()).unwrap_err();

    assert_eq!(
        err,
        FlashError::Chunk {
            phase: Phase::Write,
            chunk: 2,
            address: FLASH_BASE + 512,
            source: Error::WriteRejected { address: FLASH_BASE + 512 },
        }
    );
    assert!(!err.is_retryable());

    let sim = port.sim();
    assert_eq!(sim.writes.len(), 2);
    assert_eq!(sim.write_attempts, 3);
    assert!(sim.reads.is_empty());
    assert_eq!(sim.jumped, None);
}

#[test]
fn verify_reports_first_mismatch() {
    let port = SimPort::new(SimConfig::extended());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let data = pattern(300, 4);
    let mut on_device = data.clone();
    on_device[260] ^= 0xFF;
    port.load(FLASH_BASE, &on_device);

    let err = Flasher::new(&mut p).verify(&[MemorySegment::new(FLASH_BASE, data.clone())]).unwrap_err();

    assert_eq!(
        err,
        FlashError::VerifyMismatch { address: FLASH_BASE + 260, expected: data[260], actual: on_device[260] }
    );
}

#[test]
fn read_dump_spans_chunks() {
    let port = SimPort::new(SimConfig::extended());
    let data = pattern(600, 5);
    port.load(FLASH_BASE + 10, &data);

    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let dump = Flasher::new(&mut p).read_memory_dump(FLASH_BASE + 10, 600).unwrap();
    assert_eq!(dump, data);
    assert_eq!(
        port.sim().reads,
        vec![(FLASH_BASE + 10, 256), (FLASH_BASE + 266, 256), (FLASH_BASE + 522, 88)]
    );
}

#[test]
fn unidentified_device_uses_small_chunks() {
    let port = SimPort::new(SimConfig::extended());
    let mut p = programmer(port.clone());
    p.sync().unwrap();

    Flasher::new(&mut p).read_memory_dump(FLASH_BASE, 300).unwrap();

    let sizes: Vec<_> = port.sim().reads.iter().map(|r| r.1).collect();
    assert_eq!(sizes, vec![128, 128, 44]);
}

#[test]
fn cancel_before_first_chunk() {
    let port = SimPort::new(SimConfig::extended());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let token = CancelToken::new();
    token.cancel();

    let segments = vec![MemorySegment::new(FLASH_BASE, pattern(512, 6))];
    let err = Flasher::new(&mut p).with_cancel(token).flash(&segments, &skip_erase()).unwrap_err();

    assert_eq!(err, FlashError::Cancelled { address: FLASH_BASE, partial: false });
    assert!(port.sim().writes.is_empty());
}

#[test]
fn cancel_after_first_chunk_is_partial() {
    let port = SimPort::new(SimConfig::extended());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let token = CancelToken::new();
    let trigger = token.clone();

    let segments = vec![MemorySegment::new(FLASH_BASE, pattern(1024, 7))];
    let err = Flasher::new(&mut p)
        .with_cancel(token)
        .with_observer(move |e: ProgressEvent| {
            if e.phase == Phase::Write && e.bytes_done > 0 {
                trigger.cancel();
            }
        })
        .flash(&segments, &skip_erase())
        .unwrap_err();

    assert_eq!(err, FlashError::Cancelled { address: FLASH_BASE + 256, partial: true });
    assert!(!err.is_retryable());
    assert_eq!(port.sim().writes, vec![(FLASH_BASE, 256)]);
}

#[test]
fn page_erase_covers_image_only() {
    let port = SimPort::new(SimConfig::extended());
    port.load(FLASH_BASE, &[0x00; 16]);

    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let segments = vec![MemorySegment::new(FLASH_BASE + 0x800, pattern(0x500, 8))];
    let options = FlashOptions { erase: EraseMode::Pages, run: false, ..FlashOptions::default() };
    Flasher::new(&mut p).flash(&segments, &options).unwrap();

    assert_eq!(port.sim().erases, vec![EraseKind::Pages(vec![2, 3])]);
    // page 0 left alone
    assert_eq!(port.flash(FLASH_BASE, 16), vec![0x00; 16]);
}

#[test]
fn page_erase_unsupported_on_legacy_bootloader() {
    let port = SimPort::new(SimConfig::legacy());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let segments = vec![MemorySegment::new(FLASH_BASE, pattern(64, 9))];
    let options = FlashOptions { erase: EraseMode::Pages, ..FlashOptions::default() };
    let err = Flasher::new(&mut p).flash(&segments, &options).unwrap_err();

    assert!(matches!(err, FlashError::Device(Error::UnsupportedOperation(_))));
    assert!(port.sim().erases.is_empty());
    assert!(port.sim().writes.is_empty());
}

#[test]
fn legacy_global_erase_then_flash() {
    let port = SimPort::new(SimConfig::legacy());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let segments = vec![MemorySegment::new(FLASH_BASE, pattern(64, 10))];
    let options = FlashOptions { run: false, ..FlashOptions::default() };
    Flasher::new(&mut p).flash(&segments, &options).unwrap();

    assert_eq!(port.sim().erases, vec![EraseKind::Global]);
}

#[test]
fn empty_image_is_rejected_before_io() {
    let port = SimPort::new(SimConfig::extended());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let err = Flasher::new(&mut p).flash(&[], &FlashOptions::default()).unwrap_err();
    assert_eq!(err, FlashError::EmptyImage);

    let err = Flasher::new(&mut p)
        .flash(&[MemorySegment::new(FLASH_BASE, vec![])], &FlashOptions::default())
        .unwrap_err();
    assert_eq!(err, FlashError::EmptyImage);

    assert!(port.sim().erases.is_empty());
}

#[test]
fn sync_survives_three_nacks() {
    let port = SimPort::new(SimConfig { sync_nacks: 3, ..SimConfig::extended() });
    let mut p = programmer(port);

    let info = p.connect().unwrap();
    assert_eq!(info.chip_id, 0x410);
    assert_eq!(p.state(), State::Ready);
}

#[test]
fn sync_fails_after_four_nacks() {
    let port = SimPort::new(SimConfig { sync_nacks: 4, ..SimConfig::extended() });
    let mut p = programmer(port);

    assert_eq!(p.sync(), Err(Error::SyncTimeout { attempts: 4 }));
    assert_eq!(p.state(), State::Disconnected);
}

#[test]
fn connect_discards_stale_output() {
    let port = SimPort::new(SimConfig { idle_output: b"x".to_vec(), ..SimConfig::extended() });
    let mut p = programmer(port);

    let info = p.connect().unwrap();
    assert_eq!(info.chip_id, 0x410);
    assert_eq!(p.state(), State::Ready);
}

#[test]
fn segments_sharing_a_word_program_it_once() {
    let port = SimPort::new(SimConfig::extended());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let segments = vec![
        MemorySegment::new(FLASH_BASE + 6, vec![9, 9]),
        MemorySegment::new(FLASH_BASE + 1, vec![1, 2, 3, 4]),
        MemorySegment::new(FLASH_BASE + 0x102, vec![7; 3]),
    ];
    let options = FlashOptions { verify: true, ..skip_erase() };
    Flasher::new(&mut p).flash(&segments, &options).unwrap();

    assert_eq!(port.sim().writes, vec![(FLASH_BASE, 8), (FLASH_BASE + 0x100, 8)]);
    assert_eq!(port.flash(FLASH_BASE, 8), vec![0xFF, 1, 2, 3, 4, 0xFF, 9, 9]);
    assert_eq!(port.flash(FLASH_BASE + 0x100, 8), vec![0xFF, 0xFF, 7, 7, 7, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn read_dump_rejects_address_wrap() {
    let port = SimPort::new(SimConfig::extended());
    let mut p = programmer(port.clone());
    p.connect().unwrap();

    let err = Flasher::new(&mut p).read_memory_dump(0xFFFF_FF00, 0x200).unwrap_err();
    assert_eq!(err, FlashError::Device(Error::InvalidLength(0x200)));

    // ends exactly at the top of the address space
    let err = Flasher::new(&mut p).read_memory_dump(0xFFFF_FF00, 0x100).unwrap_err();
    assert!(matches!(err, FlashError::Chunk { .. }));

    assert!(port.sim().reads.is_empty());
    assert_eq!(p.state(), State::Ready);
}

#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
//! Fork reads, writes, seeks and space accounting through open file handles.

use hfs_core::{
    BlockBuf, BlockDevice, BlockNumber, FileId, ForkKind, FormatOptions, HfsError,
    MemoryByteDevice, MountOptions, PartitionDevice, Result, VolumeRegistry, Whence,
    format_partition,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const FLOPPY_BYTES: usize = 800 * 1024;
const ALLOC: usize = 512;

fn mounted(name: &str) -> (VolumeRegistry, MemoryByteDevice) {
    let disk = MemoryByteDevice::new(FLOPPY_BYTES);
    format_partition(disk.clone(), 0, &FormatOptions::new(name)).expect("format");
    let mut reg = VolumeRegistry::new();
    reg.mount_partition(disk.clone(), 0, &MountOptions::read_write())
        .expect("mount");
    (reg, disk)
}

fn free_blocks(reg: &mut VolumeRegistry) -> u64 {
    let v = reg.vstat(None).expect("vstat");
    v.free_bytes / u64::from(v.alloc_block_size)
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 253) as u8))
        .collect()
}

fn read_all(reg: &mut VolumeRegistry, f: FileId) -> Vec<u8> {
    reg.seek(f, 0, Whence::Start).expect("rewind");
    let mut out = Vec::new();
    let mut buf = vec![0_u8; 1500];
    loop {
        let n = reg.read(f, &mut buf).expect("read");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn ten_block_file_sets_and_clears_ten_bits() {
    let (mut reg, _disk) = mounted("Test");
    let baseline = free_blocks(&mut reg);

    reg.mkdir(None, b"Test:A").expect("mkdir");
    let f = reg
        .create(None, b"Test:A:f", *b"TEXT", *b"ttxt")
        .expect("create");
    let body = pattern(7, 10 * ALLOC);
    assert_eq!(reg.write(f, &body).expect("write"), body.len());
    // Clump-sized growth reserves 12 blocks until the handle is closed.
    assert_eq!(free_blocks(&mut reg), baseline - 12);
    reg.close(f).expect("close");

    let ent = reg.stat(None, b"Test:A:f").expect("stat");
    assert_eq!(ent.data_len, 5120);
    assert_eq!(free_blocks(&mut reg), baseline - 10);

    reg.delete(None, b"Test:A:f").expect("delete");
    assert_eq!(free_blocks(&mut reg), baseline);
}

#[test]
fn write_then_read_without_closing() {
    let (mut reg, _disk) = mounted("Rw");
    let f = reg.create(None, b"Rw:f", *b"TEXT", *b"ttxt").expect("create");
    let body = pattern(3, 1777);
    reg.write(f, &body).expect("write");
    assert_eq!(read_all(&mut reg, f), body);

    // Overwrite a span straddling a block boundary.
    reg.seek(f, 500, Whence::Start).expect("seek");
    reg.write(f, &[0xAA; 40]).expect("overwrite");
    let mut expect = body.clone();
    expect[500..540].fill(0xAA);
    assert_eq!(read_all(&mut reg, f), expect);
    assert_eq!(reg.fstat(f).expect("fstat").data_len, 1777);
    reg.close(f).expect("close");
}

#[test]
fn seek_stays_within_the_fork() {
    let (mut reg, _disk) = mounted("Seek");
    let f = reg.create(None, b"Seek:f", *b"TEXT", *b"ttxt").expect("create");
    reg.write(f, &pattern(1, 1000)).expect("write");

    assert_eq!(reg.seek(f, 0, Whence::End).expect("end"), 1000);
    let mut buf = [0_u8; 16];
    assert_eq!(reg.read(f, &mut buf).expect("read at end"), 0);
    assert!(matches!(
        reg.seek(f, 1, Whence::End),
        Err(HfsError::InvalidArgument(_))
    ));
    assert!(matches!(
        reg.seek(f, -1, Whence::Start),
        Err(HfsError::InvalidArgument(_))
    ));
    assert_eq!(reg.seek(f, -10, Whence::End).expect("back"), 990);
    let mut buf = [0_u8; 100];
    assert_eq!(reg.read(f, &mut buf).expect("tail"), 10);
    assert_eq!(reg.seek(f, -5, Whence::Current).expect("relative"), 995);
    reg.close(f).expect("close");
}

#[test]
fn truncate_defers_freeing_until_close() {
    let (mut reg, _disk) = mounted("Trunc");
    let f = reg.create(None, b"Trunc:f", *b"TEXT", *b"ttxt").expect("create");
    reg.write(f, &pattern(9, 10 * ALLOC)).expect("write");
    reg.close(f).expect("close");
    let with_file = free_blocks(&mut reg);

    let f = reg.open(None, b"Trunc:f").expect("open");
    reg.truncate(f, 3000).expect("shrink");
    reg.truncate(f, 9000).expect("growing truncate is a no-op");
    assert_eq!(reg.fstat(f).expect("fstat").data_len, 3000);
    assert_eq!(free_blocks(&mut reg), with_file);
    reg.truncate(f, 0).expect("empty");
    assert_eq!(read_all(&mut reg, f), Vec::<u8>::new());
    reg.close(f).expect("close");

    assert_eq!(free_blocks(&mut reg), with_file + 10);
    assert_eq!(reg.stat(None, b"Trunc:f").expect("stat").data_len, 0);
}

#[test]
fn flush_runs_pending_trims_on_open_files() {
    let (mut reg, _disk) = mounted("Trim");
    let f = reg.create(None, b"Trim:f", *b"TEXT", *b"ttxt").expect("create");
    reg.write(f, &pattern(2, ALLOC)).expect("write");
    let before = free_blocks(&mut reg);
    reg.flush(None).expect("flush");
    // One block kept out of the four-block clump.
    assert_eq!(free_blocks(&mut reg), before + 3);
    reg.write(f, &pattern(4, ALLOC)).expect("append");
    assert_eq!(read_all(&mut reg, f).len(), 2 * ALLOC);
    reg.close(f).expect("close");
}

#[test]
fn resource_fork_is_independent_of_data_fork() {
    let (mut reg, _disk) = mounted("Res");
    let f = reg.create(None, b"Res:f", *b"APPL", *b"demo").expect("create");
    reg.write(f, b"data fork").expect("data");
    assert_eq!(reg.getfork(f).expect("fork"), ForkKind::Data);

    reg.setfork(f, ForkKind::Resource).expect("setfork");
    assert_eq!(reg.getfork(f).expect("fork"), ForkKind::Resource);
    let res = pattern(5, 700);
    reg.write(f, &res).expect("resource");
    assert_eq!(read_all(&mut reg, f), res);

    reg.setfork(f, ForkKind::Data).expect("back to data");
    let mut buf = [0_u8; 64];
    let n = reg.read(f, &mut buf).expect("read");
    assert_eq!(&buf[..n], b"data fork");
    reg.close(f).expect("close");

    let ent = reg.stat(None, b"Res:f").expect("stat");
    assert_eq!(ent.data_len, 9);
    assert_eq!(ent.resource_len, 700);
}

#[test]
fn running_out_of_space_changes_nothing() {
    let (mut reg, _disk) = mounted("Full");
    let free = free_blocks(&mut reg);
    let f = reg.create(None, b"Full:big", *b"TEXT", *b"ttxt").expect("create");
    let too_big = vec![0_u8; (usize::try_from(free).expect("free") + 1) * ALLOC];
    assert!(matches!(reg.write(f, &too_big), Err(HfsError::NoSpace)));
    assert_eq!(free_blocks(&mut reg), free);
    assert_eq!(reg.fstat(f).expect("fstat").data_len, 0);

    // Exactly filling the volume still works; the clump falls back to the
    // precise shortfall.
    let exact = vec![0x5A_u8; usize::try_from(free).expect("free") * ALLOC];
    reg.write(f, &exact).expect("fill");
    assert_eq!(free_blocks(&mut reg), 0);
    reg.close(f).expect("close");
    reg.delete(None, b"Full:big").expect("delete");
    assert_eq!(free_blocks(&mut reg), free);
}

#[test]
fn fragmented_forks_spill_into_overflow_records() {
    let (mut reg, disk) = mounted("Frag");
    let baseline = free_blocks(&mut reg);
    let a = reg.create(None, b"Frag:a", *b"TEXT", *b"ttxt").expect("a");
    let b = reg.create(None, b"Frag:b", *b"TEXT", *b"ttxt").expect("b");

    // Alternating clump-sized writes leave each fork with five extents.
    let mut want_a = Vec::new();
    let mut want_b = Vec::new();
    for round in 0..5_u8 {
        let chunk_a = pattern(round, 4 * ALLOC);
        let chunk_b = pattern(round + 100, 4 * ALLOC);
        reg.write(a, &chunk_a).expect("write a");
        reg.write(b, &chunk_b).expect("write b");
        want_a.extend(chunk_a);
        want_b.extend(chunk_b);
    }
    assert_eq!(read_all(&mut reg, a), want_a);
    assert_eq!(read_all(&mut reg, b), want_b);
    reg.close(a).expect("close a");
    reg.close(b).expect("close b");
    reg.umount(None).expect("umount");

    let mut reg = VolumeRegistry::new();
    reg.mount_partition(disk, 0, &MountOptions::read_write())
        .expect("remount");
    let a = reg.open(None, b"Frag:a").expect("open a");
    assert_eq!(read_all(&mut reg, a), want_a);
    reg.close(a).expect("close a");

    reg.delete(None, b"Frag:a").expect("delete a");
    reg.delete(None, b"Frag:b").expect("delete b");
    assert_eq!(free_blocks(&mut reg), baseline);
}

#[test]
fn zero_new_blocks_scrubs_reused_blocks() {
    let disk = MemoryByteDevice::new(FLOPPY_BYTES);
    format_partition(disk.clone(), 0, &FormatOptions::new("Zero")).expect("format");
    let opts = MountOptions {
        zero_new_blocks: true,
        ..MountOptions::read_write()
    };
    let mut reg = VolumeRegistry::new();
    reg.mount_partition(disk.clone(), 0, &opts).expect("mount");

    let f = reg.create(None, b"Zero:old", *b"TEXT", *b"ttxt").expect("create");
    reg.write(f, &[0xFF; 4 * ALLOC]).expect("write");
    reg.close(f).expect("close");
    reg.delete(None, b"Zero:old").expect("delete");

    // The new fork reuses the freed clump and zeroes all four blocks.
    let f = reg.create(None, b"Zero:new", *b"TEXT", *b"ttxt").expect("create");
    reg.write(f, &[2]).expect("write one byte");
    reg.close(f).expect("close");
    let f = reg.open(None, b"Zero:new").expect("open");
    let mut buf = [0_u8; 4];
    assert_eq!(reg.read(f, &mut buf).expect("read"), 1);
    assert_eq!(buf[0], 2);
    reg.close(f).expect("close");
    reg.umount(None).expect("umount");

    let image = disk.to_vec();
    assert!(
        image.chunks(ALLOC).all(|sector| sector.iter().any(|&b| b != 0xFF)),
        "a sector of the deleted file survived allocation"
    );
}

#[test]
fn stale_file_handles_are_rejected() {
    let (mut reg, _disk) = mounted("Stale");
    let f = reg.create(None, b"Stale:f", *b"TEXT", *b"ttxt").expect("create");
    reg.close(f).expect("close");
    assert!(matches!(reg.close(f), Err(HfsError::BadHandle)));
    assert!(matches!(reg.write(f, b"x"), Err(HfsError::BadHandle)));

    let g = reg.open(None, b"Stale:f").expect("open");
    reg.umount(None).expect("umount closes files");
    assert!(matches!(reg.fstat(g), Err(HfsError::BadHandle)));
}

/// Rejects every write while `fail` is set.
struct FailingWrites {
    inner: PartitionDevice<MemoryByteDevice>,
    fail: Arc<AtomicBool>,
}

impl BlockDevice for FailingWrites {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HfsError::Io(std::io::Error::other("write refused")));
        }
        self.inner.write_block(block, data)
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }
}

#[test]
fn setfork_switches_even_when_the_flush_fails() {
    let disk = MemoryByteDevice::new(FLOPPY_BYTES);
    format_partition(disk.clone(), 0, &FormatOptions::new("Sw")).expect("format");
    let fail = Arc::new(AtomicBool::new(false));
    let dev = FailingWrites {
        inner: PartitionDevice::whole(disk).expect("partition"),
        fail: Arc::clone(&fail),
    };
    let opts = MountOptions {
        no_cache: true,
        ..MountOptions::read_write()
    };
    let mut reg = VolumeRegistry::new();
    reg.mount_device(Box::new(dev), &opts).expect("mount");

    let f = reg.create(None, b"Sw:f", *b"TEXT", *b"ttxt").expect("create");
    reg.write(f, &pattern(6, 3 * ALLOC)).expect("write");
    reg.truncate(f, 10).expect("shrink");
    assert_eq!(reg.seek(f, 0, Whence::Current).expect("pos"), 10);

    fail.store(true, Ordering::SeqCst);
    assert!(matches!(
        reg.setfork(f, ForkKind::Resource),
        Err(HfsError::Io(_))
    ));
    assert_eq!(reg.getfork(f).expect("fork"), ForkKind::Resource);
    assert_eq!(reg.seek(f, 0, Whence::Current).expect("rewound"), 0);
    assert_eq!(reg.fstat(f).expect("fstat").resource_len, 0);

    // The failed write poisoned the volume; further changes are refused and
    // closing drops what could not be written.
    fail.store(false, Ordering::SeqCst);
    assert!(matches!(reg.truncate(f, 0), Err(HfsError::Poisoned(_))));
    reg.close(f).expect("close on a poisoned volume");
}

// ── Properties ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Write { at: usize, len: usize, seed: u8 },
    Truncate { to: usize },
    Reopen,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0_usize..6000, 1_usize..3000, any::<u8>())
            .prop_map(|(at, len, seed)| Op::Write { at, len, seed }),
        1 => (0_usize..6000).prop_map(|to| Op::Truncate { to }),
        1 => Just(Op::Reopen),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn fork_matches_a_byte_vector_model(ops in proptest::collection::vec(op(), 1..24)) {
        let (mut reg, _disk) = mounted("Model");
        let baseline = free_blocks(&mut reg);
        let mut f = reg.create(None, b"Model:f", *b"TEXT", *b"ttxt").expect("create");
        let mut model: Vec<u8> = Vec::new();

        for op in ops {
            match op {
                Op::Write { at, len, seed } => {
                    let at = at.min(model.len());
                    let data = pattern(seed, len);
                    reg.seek(f, i64::try_from(at).expect("offset"), Whence::Start).expect("seek");
                    reg.write(f, &data).expect("write");
                    if model.len() < at + len {
                        model.resize(at + len, 0);
                    }
                    model[at..at + len].copy_from_slice(&data);
                }
                Op::Truncate { to } => {
                    reg.truncate(f, u32::try_from(to).expect("len")).expect("truncate");
                    model.truncate(to);
                }
                Op::Reopen => {
                    reg.close(f).expect("close");
                    f = reg.open(None, b"Model:f").expect("open");
                }
            }
            prop_assert_eq!(read_all(&mut reg, f), model.clone());
        }

        reg.close(f).expect("close");
        let used = baseline - free_blocks(&mut reg);
        prop_assert_eq!(used, u64::try_from(model.len().div_ceil(ALLOC)).expect("blocks"));
        reg.delete(None, b"Model:f").expect("delete");
        prop_assert_eq!(free_blocks(&mut reg), baseline);
    }
}

//! End-to-end: a resolved partition feeds a window verbatim.
//!
//! Builds a synthetic MBR image, resolves a partition to its byte range,
//! opens a window over that range, and checks that the window exposes
//! exactly the partition's bytes.

use sfs_core::{WindowOptions, WindowedFile};
use sfs_part::SECTOR_SIZE;
use std::io::Write;
use tempfile::NamedTempFile;

const ENTRY_OFFSET: usize = 446;

fn put_entry(image: &mut [u8], slot: usize, kind: u8, start: u32, sectors: u32) {
    let base = ENTRY_OFFSET + slot * 16;
    image[base + 4] = kind;
    image[base + 8..base + 12].copy_from_slice(&start.to_le_bytes());
    image[base + 12..base + 16].copy_from_slice(&sectors.to_le_bytes());
}

#[test]
fn partition_range_becomes_the_mount_window() {
    let sectors = 64_u64;
    let mut image = vec![0_u8; (sectors * SECTOR_SIZE) as usize];
    image[510] = 0x55;
    image[511] = 0xAA;
    put_entry(&mut image, 0, 0x83, 8, 16);
    put_entry(&mut image, 1, 0x07, 24, 8);

    // Give the first partition recognizable contents.
    let part_start = (8 * SECTOR_SIZE) as usize;
    let part_len = (16 * SECTOR_SIZE) as usize;
    for (i, byte) in image[part_start..part_start + part_len].iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }

    let mut file = NamedTempFile::new().expect("create image");
    file.write_all(&image).expect("write image");
    file.flush().expect("flush image");

    let entry = sfs_part::get_partition_info(file.path(), 0).expect("resolve partition");
    assert_eq!(entry.offset, 8 * SECTOR_SIZE);
    assert_eq!(entry.length, 16 * SECTOR_SIZE);

    let window = WindowedFile::open(
        file.path(),
        &WindowOptions {
            offset: entry.offset,
            size_limit: Some(entry.length),
            read_only: true,
        },
    )
    .expect("open window over partition");

    let attrs = window.attributes().expect("stat window");
    assert_eq!(attrs.size, entry.length);

    // The window's first bytes are the partition's first bytes.
    let head = window.read_at(0, 16).expect("read head");
    let expected: Vec<u8> = (0..16).map(|i| (i % 251) as u8).collect();
    assert_eq!(head, expected);

    // Reads clamp at the partition's end.
    let tail = window
        .read_at(entry.length - 8, 64)
        .expect("read across end");
    assert_eq!(tail.len(), 8);

    // The partition window is read-only end to end.
    assert!(window.write_at(0, &[1]).is_err());
}

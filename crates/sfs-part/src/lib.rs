#![forbid(unsafe_code)]
//! Partition-table resolver.
//!
//! Decodes MBR and GPT partition tables from a file-backed disk image and
//! reports each partition's byte offset and length, so a partition index can
//! stand in for an explicit `offset`/`sizelimit` pair. Every query opens and
//! fully releases its own table-reading session; there is no persistent
//! cache.
//!
//! Layout references: MBR entries live at byte 446 of sector 0 (16 bytes
//! each, four slots, `0x55AA` signature); the GPT header lives in LBA 1
//! behind a protective-MBR entry of type `0xEE`, with the entry array at the
//! LBA it names. Logical partitions are enumerated by walking the EBR chain
//! of the first extended entry, matching fdisk output. CRC fields are not
//! verified; validation is structural.
//!
//! A regular-file image carries no hardware sector size, so table units are
//! converted to bytes at the conventional 512.

use serde::Serialize;
use sfs_error::{Result, SliceError};
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::warn;

/// Sector size used to convert table units to byte offsets.
pub const SECTOR_SIZE: u64 = 512;

const MBR_ENTRY_OFFSET: usize = 446;
const MBR_ENTRY_LEN: usize = 16;
const MBR_DISK_SIG_OFFSET: usize = 440;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_MIN_ENTRY_LEN: usize = 128;
const GPT_MAX_ENTRY_LEN: usize = 4096;
const GPT_MAX_ENTRIES: u32 = 4096;
const EBR_CHAIN_LIMIT: usize = 128;

/// MBR partition types marking an extended container.
const EXTENDED_TYPES: [u8; 3] = [0x05, 0x0F, 0x85];

/// One resolved partition-table entry.
///
/// `offset` and `length` are in bytes and feed a mount window verbatim.
/// `name`, `uuid`, and `kind` are best-effort descriptive fields: absent
/// underlying values yield empty strings, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    /// 1-based position in the listing.
    pub number: usize,
    /// Byte offset of the partition within the image.
    pub offset: u64,
    /// Byte length of the partition.
    pub length: u64,
    /// Partition label (GPT only; MBR has none).
    pub name: String,
    /// Unique partition identifier.
    pub uuid: String,
    /// Partition type: a GUID for GPT, a hex type byte for MBR.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Count the entries in `path`'s partition table.
///
/// Zero is a valid count: a signature-bearing table with no used slots.
pub fn count_partitions(path: &Path) -> Result<usize> {
    Ok(list_partitions(path)?.len())
}

/// Resolve one entry by 0-based index.
///
/// Fails with `MissingPartition` when `index` is past the end of the table.
pub fn get_partition_info(path: &Path, index: usize) -> Result<PartitionEntry> {
    let entries = list_partitions(path)?;
    let count = entries.len();
    entries
        .into_iter()
        .nth(index)
        .ok_or(SliceError::MissingPartition { index, count })
}

/// Decode the full partition table of `path`.
pub fn list_partitions(path: &Path) -> Result<Vec<PartitionEntry>> {
    let session = TableSession::open(path)?;
    let mbr = session.read_sector(0)?;

    if mbr[510] != 0x55 || mbr[511] != 0xAA {
        return Err(SliceError::TableUnavailable(format!(
            "{} carries no partition-table signature",
            path.display()
        )));
    }

    // A protective-MBR entry promotes the whole image to GPT.
    let protective = (0..4)
        .any(|slot| mbr[MBR_ENTRY_OFFSET + slot * MBR_ENTRY_LEN + 4] == 0xEE);
    if protective {
        session.list_gpt()
    } else {
        session.list_mbr(&mbr)
    }
}

/// A stateless, read-only view of one image's table region.
struct TableSession {
    file: File,
}

impl TableSession {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => {
                SliceError::InvalidArgument(format!("no such file: {}", path.display()))
            }
            ErrorKind::PermissionDenied => SliceError::PermissionDenied,
            _ => SliceError::Io(err),
        })?;
        Ok(Self { file })
    }

    fn read_sector(&self, lba: u64) -> Result<[u8; 512]> {
        let pos = lba.checked_mul(SECTOR_SIZE).ok_or_else(|| {
            SliceError::TableUnavailable(format!("sector {lba} offset overflows"))
        })?;
        let mut sector = [0_u8; 512];
        self.file
            .read_exact_at(&mut sector, pos)
            .map_err(|err| match err.kind() {
                ErrorKind::UnexpectedEof => SliceError::TableUnavailable(format!(
                    "image ends before sector {lba}"
                )),
                _ => SliceError::Io(err),
            })?;
        Ok(sector)
    }

    // ── MBR ─────────────────────────────────────────────────────────────

    fn list_mbr(&self, mbr: &[u8; 512]) -> Result<Vec<PartitionEntry>> {
        let disk_sig = le_u32(mbr, MBR_DISK_SIG_OFFSET);
        let mut entries = Vec::new();
        let mut extended_start = None;

        for slot in 0..4 {
            let raw = &mbr[MBR_ENTRY_OFFSET + slot * MBR_ENTRY_LEN..][..MBR_ENTRY_LEN];
            let kind = raw[4];
            if kind == 0 {
                continue;
            }
            let entry = mbr_entry(raw, slot, 0)?;
            if EXTENDED_TYPES.contains(&kind) && extended_start.is_none() {
                extended_start = Some(le_u32(raw, 8) as u64);
            }
            entries.push(entry);
        }

        if let Some(ext_start) = extended_start {
            self.walk_ebr_chain(ext_start, &mut entries)?;
        }

        number_entries(&disk_uuid(disk_sig), &mut entries);
        Ok(entries)
    }

    /// Append the logical partitions linked from an extended container.
    ///
    /// Each EBR holds the logical partition in slot 0 (start relative to
    /// that EBR) and the next link in slot 1 (start relative to the
    /// extended container). A malformed EBR ends the chain rather than
    /// failing the whole listing, matching fdisk's tolerance.
    fn walk_ebr_chain(&self, ext_start: u64, entries: &mut Vec<PartitionEntry>) -> Result<()> {
        let mut link = 0_u64;
        for _ in 0..EBR_CHAIN_LIMIT {
            let ebr_lba = ext_start + link;
            let ebr = match self.read_sector(ebr_lba) {
                Ok(sector) => sector,
                Err(err) => {
                    warn!(ebr_lba, error = %err, "unreadable EBR ends logical chain");
                    return Ok(());
                }
            };
            if ebr[510] != 0x55 || ebr[511] != 0xAA {
                warn!(ebr_lba, "EBR without signature ends logical chain");
                return Ok(());
            }

            let logical = &ebr[MBR_ENTRY_OFFSET..][..MBR_ENTRY_LEN];
            if logical[4] != 0 {
                let index = entries.len();
                entries.push(mbr_entry(logical, index, ebr_lba)?);
            }

            let next = &ebr[MBR_ENTRY_OFFSET + MBR_ENTRY_LEN..][..MBR_ENTRY_LEN];
            if next[4] == 0 || le_u32(next, 12) == 0 {
                return Ok(());
            }
            link = le_u32(next, 8) as u64;
        }
        warn!(ext_start, "EBR chain exceeds {EBR_CHAIN_LIMIT} links, truncating");
        Ok(())
    }

    // ── GPT ─────────────────────────────────────────────────────────────

    fn list_gpt(&self) -> Result<Vec<PartitionEntry>> {
        let header = self.read_sector(1)?;
        if &header[0..8] != GPT_SIGNATURE {
            return Err(SliceError::TableUnavailable(
                "protective MBR without a GPT header".into(),
            ));
        }

        let entry_lba = le_u64(&header, 72);
        let num_entries = le_u32(&header, 80);
        let entry_len = le_u32(&header, 84) as usize;

        if num_entries > GPT_MAX_ENTRIES {
            return Err(SliceError::TableUnavailable(format!(
                "GPT claims {num_entries} entries"
            )));
        }
        if entry_len < GPT_MIN_ENTRY_LEN || entry_len > GPT_MAX_ENTRY_LEN {
            return Err(SliceError::TableUnavailable(format!(
                "GPT entry size {entry_len} out of range"
            )));
        }

        let total = num_entries as usize * entry_len;
        let mut raw = Vec::new();
        raw.try_reserve_exact(total)
            .map_err(|_| SliceError::AllocationFailure)?;
        raw.resize(total, 0);

        let array_pos = entry_lba.checked_mul(SECTOR_SIZE).ok_or_else(|| {
            SliceError::TableUnavailable("GPT entry array offset overflows".into())
        })?;
        self.file
            .read_exact_at(&mut raw, array_pos)
            .map_err(|err| match err.kind() {
                ErrorKind::UnexpectedEof => SliceError::TableUnavailable(
                    "GPT entry array extends past the end of the image".into(),
                ),
                _ => SliceError::Io(err),
            })?;

        let mut entries = Vec::new();
        for slot in 0..num_entries as usize {
            let entry = &raw[slot * entry_len..][..entry_len];
            let mut type_guid = [0_u8; 16];
            type_guid.copy_from_slice(&entry[0..16]);
            if type_guid == [0_u8; 16] {
                continue;
            }

            let index = entries.len();
            let first_lba = le_u64(entry, 32);
            let last_lba = le_u64(entry, 40);
            if first_lba == 0 || last_lba < first_lba {
                return Err(SliceError::CorruptPartition {
                    index,
                    detail: format!("LBA range {first_lba}..{last_lba} is not usable"),
                });
            }

            let offset = first_lba.checked_mul(SECTOR_SIZE).ok_or_else(|| {
                SliceError::CorruptPartition {
                    index,
                    detail: "start offset overflows".into(),
                }
            })?;
            let length = (last_lba - first_lba + 1)
                .checked_mul(SECTOR_SIZE)
                .ok_or_else(|| SliceError::CorruptPartition {
                    index,
                    detail: "length overflows".into(),
                })?;

            let mut unique_guid = [0_u8; 16];
            unique_guid.copy_from_slice(&entry[16..32]);
            entries.push(PartitionEntry {
                number: index + 1,
                offset,
                length,
                name: utf16le_name(&entry[56..128]),
                uuid: guid_string(&unique_guid),
                kind: guid_string(&type_guid),
            });
        }
        Ok(entries)
    }
}

/// Decode one 16-byte MBR slot into a byte-addressed entry.
///
/// `ebr_lba` is 0 for primary slots; for logical partitions it is the LBA
/// of the owning EBR, to which the entry's start is relative.
fn mbr_entry(raw: &[u8], index: usize, ebr_lba: u64) -> Result<PartitionEntry> {
    let start = le_u32(raw, 8) as u64;
    let sectors = le_u32(raw, 12) as u64;
    if start == 0 || sectors == 0 {
        return Err(SliceError::CorruptPartition {
            index,
            detail: "entry lacks a defined start or size".into(),
        });
    }

    let abs_start = ebr_lba + start;
    let offset = abs_start
        .checked_mul(SECTOR_SIZE)
        .ok_or_else(|| SliceError::CorruptPartition {
            index,
            detail: "start offset overflows".into(),
        })?;
    let length = sectors
        .checked_mul(SECTOR_SIZE)
        .ok_or_else(|| SliceError::CorruptPartition {
            index,
            detail: "length overflows".into(),
        })?;

    Ok(PartitionEntry {
        number: 0, // assigned once the listing is complete
        offset,
        length,
        name: String::new(),
        uuid: String::new(),
        kind: format!("{:#04x}", raw[4]),
    })
}

/// Assign 1-based numbers and derive MBR partition UUIDs
/// (`disksig-NN`, the conventional file-image form).
fn number_entries(disk_uuid: &str, entries: &mut [PartitionEntry]) {
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.number = i + 1;
        entry.uuid = format!("{disk_uuid}-{:02}", i + 1);
    }
}

fn disk_uuid(disk_sig: u32) -> String {
    format!("{disk_sig:08x}")
}

/// Render a GPT GUID in its canonical mixed-endian text form.
fn guid_string(guid: &[u8; 16]) -> String {
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        le_u32(guid, 0),
        le_u16(guid, 4),
        le_u16(guid, 6),
        guid[8],
        guid[9],
        guid[10],
        guid[11],
        guid[12],
        guid[13],
        guid[14],
        guid[15],
    )
}

/// Decode a NUL-terminated UTF-16LE partition name.
fn utf16le_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn le_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        buf[off],
        buf[off + 1],
        buf[off + 2],
        buf[off + 3],
        buf[off + 4],
        buf[off + 5],
        buf[off + 6],
        buf[off + 7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image_file(sectors: u64) -> (NamedTempFile, Vec<u8>) {
        let file = NamedTempFile::new().expect("create temp image");
        (file, vec![0_u8; (sectors * SECTOR_SIZE) as usize])
    }

    fn finish(mut file: NamedTempFile, image: Vec<u8>) -> NamedTempFile {
        file.write_all(&image).expect("write image");
        file.flush().expect("flush image");
        file
    }

    fn sign(image: &mut [u8], sector: u64) {
        let base = (sector * SECTOR_SIZE) as usize;
        image[base + 510] = 0x55;
        image[base + 511] = 0xAA;
    }

    fn put_mbr_entry(image: &mut [u8], sector: u64, slot: usize, kind: u8, start: u32, len: u32) {
        let base = (sector * SECTOR_SIZE) as usize + MBR_ENTRY_OFFSET + slot * MBR_ENTRY_LEN;
        image[base + 4] = kind;
        image[base + 8..base + 12].copy_from_slice(&start.to_le_bytes());
        image[base + 12..base + 16].copy_from_slice(&len.to_le_bytes());
    }

    fn mbr_fixture() -> NamedTempFile {
        let (file, mut image) = image_file(64);
        sign(&mut image, 0);
        image[MBR_DISK_SIG_OFFSET..MBR_DISK_SIG_OFFSET + 4]
            .copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        put_mbr_entry(&mut image, 0, 0, 0x83, 8, 16);
        put_mbr_entry(&mut image, 0, 1, 0x07, 24, 8);
        finish(file, image)
    }

    #[test]
    fn mbr_listing_reports_byte_offsets() {
        let img = mbr_fixture();
        let entries = list_partitions(img.path()).unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].number, 1);
        assert_eq!(entries[0].offset, 8 * SECTOR_SIZE);
        assert_eq!(entries[0].length, 16 * SECTOR_SIZE);
        assert_eq!(entries[0].kind, "0x83");
        assert_eq!(entries[0].uuid, "deadbeef-01");
        assert_eq!(entries[0].name, "");

        assert_eq!(entries[1].number, 2);
        assert_eq!(entries[1].offset, 24 * SECTOR_SIZE);
        assert_eq!(entries[1].kind, "0x07");
    }

    #[test]
    fn count_matches_listing() {
        let img = mbr_fixture();
        assert_eq!(count_partitions(img.path()).unwrap(), 2);
    }

    #[test]
    fn info_resolves_by_zero_based_index() {
        let img = mbr_fixture();
        let part = get_partition_info(img.path(), 1).unwrap();
        assert_eq!(part.number, 2);
        assert_eq!(part.offset, 24 * SECTOR_SIZE);
        assert_eq!(part.length, 8 * SECTOR_SIZE);
    }

    #[test]
    fn info_past_end_is_missing_partition() {
        let img = mbr_fixture();
        let err = get_partition_info(img.path(), 2).unwrap_err();
        assert!(
            matches!(err, SliceError::MissingPartition { index: 2, count: 2 }),
            "unexpected error: {err:?}"
        );
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn empty_table_counts_zero() {
        let (file, mut image) = image_file(4);
        sign(&mut image, 0);
        let img = finish(file, image);
        assert_eq!(count_partitions(img.path()).unwrap(), 0);
    }

    #[test]
    fn missing_signature_is_table_unavailable() {
        let (file, image) = image_file(4);
        let img = finish(file, image);
        let err = list_partitions(img.path()).unwrap_err();
        assert!(matches!(err, SliceError::TableUnavailable(_)));
    }

    #[test]
    fn undersized_image_is_table_unavailable() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0_u8; 100]).unwrap();
        file.flush().unwrap();
        let err = list_partitions(file.path()).unwrap_err();
        assert!(matches!(err, SliceError::TableUnavailable(_)));
    }

    #[test]
    fn absent_path_is_invalid_argument() {
        let err = list_partitions(Path::new("/no/such/image.bin")).unwrap_err();
        assert!(matches!(err, SliceError::InvalidArgument(_)));
    }

    #[test]
    fn zero_start_primary_is_corrupt() {
        let (file, mut image) = image_file(4);
        sign(&mut image, 0);
        put_mbr_entry(&mut image, 0, 0, 0x83, 0, 16);
        let img = finish(file, image);
        let err = list_partitions(img.path()).unwrap_err();
        assert!(matches!(err, SliceError::CorruptPartition { index: 0, .. }));
    }

    #[test]
    fn logical_partitions_follow_the_ebr_chain() {
        let (file, mut image) = image_file(128);
        sign(&mut image, 0);
        put_mbr_entry(&mut image, 0, 0, 0x83, 8, 16);
        // Extended container at sector 32, 64 sectors long.
        put_mbr_entry(&mut image, 0, 1, 0x05, 32, 64);

        // First EBR: logical at +1 (4 sectors), link to EBR at +8.
        sign(&mut image, 32);
        put_mbr_entry(&mut image, 32, 0, 0x83, 1, 4);
        put_mbr_entry(&mut image, 32, 1, 0x05, 8, 8);

        // Second EBR: final logical at +2 (5 sectors), no link.
        sign(&mut image, 40);
        put_mbr_entry(&mut image, 40, 0, 0x07, 2, 5);

        let img = finish(file, image);
        let entries = list_partitions(img.path()).unwrap();
        assert_eq!(entries.len(), 4);

        // Primary, extended container, then logicals in chain order.
        assert_eq!(entries[1].offset, 32 * SECTOR_SIZE);
        assert_eq!(entries[1].kind, "0x05");
        assert_eq!(entries[2].offset, 33 * SECTOR_SIZE);
        assert_eq!(entries[2].length, 4 * SECTOR_SIZE);
        assert_eq!(entries[3].offset, 42 * SECTOR_SIZE);
        assert_eq!(entries[3].length, 5 * SECTOR_SIZE);
        assert_eq!(entries[3].number, 4);
    }

    // ── GPT fixtures ────────────────────────────────────────────────────

    fn put_gpt_entry(
        image: &mut [u8],
        array_base: usize,
        slot: usize,
        type_guid: [u8; 16],
        unique_guid: [u8; 16],
        first: u64,
        last: u64,
        name: &str,
    ) {
        let base = array_base + slot * 128;
        image[base..base + 16].copy_from_slice(&type_guid);
        image[base + 16..base + 32].copy_from_slice(&unique_guid);
        image[base + 32..base + 40].copy_from_slice(&first.to_le_bytes());
        image[base + 40..base + 48].copy_from_slice(&last.to_le_bytes());
        for (i, unit) in name.encode_utf16().enumerate().take(36) {
            let at = base + 56 + i * 2;
            image[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    fn gpt_fixture(first: u64, last: u64) -> NamedTempFile {
        let (file, mut image) = image_file(64);
        sign(&mut image, 0);
        put_mbr_entry(&mut image, 0, 0, 0xEE, 1, 63);

        let header = SECTOR_SIZE as usize;
        image[header..header + 8].copy_from_slice(GPT_SIGNATURE);
        image[header + 72..header + 80].copy_from_slice(&2_u64.to_le_bytes()); // entry array LBA
        image[header + 80..header + 84].copy_from_slice(&2_u32.to_le_bytes()); // entries
        image[header + 84..header + 88].copy_from_slice(&128_u32.to_le_bytes()); // entry size

        let array = 2 * SECTOR_SIZE as usize;
        let type_guid = [0x11_u8; 16];
        put_gpt_entry(&mut image, array, 0, type_guid, [0x22_u8; 16], first, last, "boot");
        put_gpt_entry(&mut image, array, 1, type_guid, [0x33_u8; 16], 20, 29, "root");
        finish(file, image)
    }

    #[test]
    fn gpt_listing_decodes_names_and_guids() {
        let img = gpt_fixture(10, 19);
        let entries = list_partitions(img.path()).unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].number, 1);
        assert_eq!(entries[0].offset, 10 * SECTOR_SIZE);
        assert_eq!(entries[0].length, 10 * SECTOR_SIZE);
        assert_eq!(entries[0].name, "boot");
        assert_eq!(entries[0].uuid, "22222222-2222-2222-2222-222222222222");
        assert_eq!(entries[0].kind, "11111111-1111-1111-1111-111111111111");

        assert_eq!(entries[1].name, "root");
        assert_eq!(entries[1].offset, 20 * SECTOR_SIZE);
    }

    #[test]
    fn gpt_reversed_lba_range_is_corrupt() {
        let img = gpt_fixture(19, 10);
        let err = list_partitions(img.path()).unwrap_err();
        assert!(matches!(err, SliceError::CorruptPartition { index: 0, .. }));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn protective_mbr_without_header_is_table_unavailable() {
        let (file, mut image) = image_file(8);
        sign(&mut image, 0);
        put_mbr_entry(&mut image, 0, 0, 0xEE, 1, 7);
        let img = finish(file, image);
        let err = list_partitions(img.path()).unwrap_err();
        assert!(matches!(err, SliceError::TableUnavailable(_)));
    }

    #[test]
    fn truncated_gpt_entry_array_is_table_unavailable() {
        let (file, mut image) = image_file(3);
        sign(&mut image, 0);
        put_mbr_entry(&mut image, 0, 0, 0xEE, 1, 2);
        let header = SECTOR_SIZE as usize;
        image[header..header + 8].copy_from_slice(GPT_SIGNATURE);
        // Entry array claims to start past the end of the image.
        image[header + 72..header + 80].copy_from_slice(&100_u64.to_le_bytes());
        image[header + 80..header + 84].copy_from_slice(&4_u32.to_le_bytes());
        image[header + 84..header + 88].copy_from_slice(&128_u32.to_le_bytes());
        let img = finish(file, image);
        let err = list_partitions(img.path()).unwrap_err();
        assert!(matches!(err, SliceError::TableUnavailable(_)));
    }

    #[test]
    fn guid_text_form_is_mixed_endian() {
        // On-disk bytes of the EFI System Partition type GUID.
        let guid: [u8; 16] = [
            0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E,
            0xC9, 0x3B,
        ];
        assert_eq!(guid_string(&guid), "C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
    }
}

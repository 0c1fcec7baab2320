//! On-disk format constants: magic/version stamps, delimiter sentinels and
//! default sizing. Mirrors `kissdb.h`'s `#define` block; values are fixed at
//! build time and are not portable across polynomial/endianness choices
//! (see `errors.rs` and the crate's top-level docs).

/// Operating system page size, queried once and cached. Falls back to 4096
/// (the reference KISSDB page size) if the platform query fails.
lazy_static! {
    pub static ref OS_PAGE_SIZE: usize = {
        let size = page_size::get();
        if size == 0 {
            4096
        } else {
            size
        }
    };
}

/// File format identifier. Bumped whenever the on-disk layout changes.
pub const KISSDB_MAJOR_VERSION: u8 = 2;
pub const KISSDB_MINOR_VERSION: u8 = 3;

/// Magic stamp occupying the first three bytes of the header.
pub const MAGIC: &[u8; 3] = b"KdB";

/// Header is always exactly one page-sized block, fixed at 4096 bytes
/// regardless of host page size so the header bytes are comparable across
/// machines even when `OS_PAGE_SIZE` differs.
pub const HEADER_SIZE: u64 = 4096;

/// Default hash-table slot count per page (510 + 1 reserved link slot fits
/// three 4 KiB pages, matching the reference layout).
pub const DEFAULT_HASH_TABLE_SIZE: u16 = 510;

/// Default maximum key length in bytes.
pub const DEFAULT_MAX_KEY_SIZE: u64 = 128;

/// Default maximum value length in bytes.
pub const DEFAULT_MAX_VALUE_SIZE: u64 = 8028;

/// Data block delimiters (low 32 bits of the 64-bit on-disk field).
/// Four pairs -- {A-live, B-live, A-tombstoned, B-tombstoned} -- chosen so
/// none is a prefix of another in the 4-byte window, which is what makes a
/// blind delimiter scan over the raw file unambiguous during recovery.
pub const DATA_BLOCK_A_START_DELIMITER: u32 = 0x2AAA_AAAA;
pub const DATA_BLOCK_A_END_DELIMITER: u32 = 0x5555_5555;

pub const DATA_BLOCK_B_START_DELIMITER: u32 = 0xE38E_38E3;
pub const DATA_BLOCK_B_END_DELIMITER: u32 = 0xAAAA_AAA8;

pub const DATA_BLOCK_A_DELETED_START_DELIMITER: u32 = 0xAAAA_AAAA;
pub const DATA_BLOCK_A_DELETED_END_DELIMITER: u32 = 0xD555_5555;

pub const DATA_BLOCK_B_DELETED_START_DELIMITER: u32 = 0x7E07_E07E;
pub const DATA_BLOCK_B_DELETED_END_DELIMITER: u32 = 0x81F8_1F81;

/// Hash-table page delimiters.
pub const HASHTABLE_START_DELIMITER: u32 = 0x3333_3333;
pub const HASHTABLE_END_DELIMITER: u32 = 0xCCCC_CCCC;

/// Selector values: which of (offsetA, offsetB) is the committed-latest one.
pub const SELECTOR_A: u8 = 0;
pub const SELECTOR_B: u8 = 1;

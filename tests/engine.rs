//! End-to-end engine tests against the documented on-disk format (spec §6,
//! §8). `block`/`page`/`constants` are private to the crate, so the
//! fault-injection scenarios (E3, E4, crash durability) reconstruct the
//! handful of byte offsets they need directly from the bit-exact layout
//! documented in spec.md §6, rather than importing internals.
use std::fs;
use std::path::Path;

use kissdb::{close, delete_key, list_keys, list_size, open, read_key, write_key, DbError, OpenMode, Purpose};
use tempfile::tempdir;

const HEADER_SIZE: u64 = 4096;

fn read_value(handle: i32, key: &[u8], buf: &mut [u8]) -> Result<Vec<u8>, DbError> {
    let n = read_key(handle, Purpose::Db, key, buf)?;
    Ok(buf[..n].to_vec())
}

fn open_db(path: &Path, create: bool, key_size: u64, value_size: u64, slot_count: u16) -> i32 {
    let mut mode = OpenMode::WRITE_THROUGH;
    if create {
        mode |= OpenMode::CREATE;
    }
    open(path, mode, key_size, value_size, slot_count).unwrap()
}

fn open_cached_db(path: &Path, create: bool, key_size: u64, value_size: u64, slot_count: u16) -> i32 {
    let mut mode = OpenMode::empty();
    if create {
        mode |= OpenMode::CREATE;
    }
    open(path, mode, key_size, value_size, slot_count).unwrap()
}

/// Finds every occurrence of `needle` in `haystack`, in ascending order.
fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut hits = Vec::new();
    let mut start = 0;
    while start + needle.len() <= haystack.len() {
        if &haystack[start..start + needle.len()] == needle {
            hits.push(start);
        }
        start += 1;
    }
    hits
}

// E1: write 300 keys, read them all back, close, reopen without create,
// confirm durability.
#[test]
fn e1_bulk_write_then_reopen_durability() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("e1.kdb");

    let h = open_db(&path, true, 128, 8028, 510);
    for i in 0..300 {
        let key = format!("Key_in_loop_{}_{}", i, i * i);
        let value = format!("DATA-{}", i);
        write_key(h, Purpose::Db, key.as_bytes(), value.as_bytes()).unwrap();
    }
    let mut buf = vec![0u8; 8028];
    for i in 0..300 {
        let key = format!("Key_in_loop_{}_{}", i, i * i);
        let expected = format!("DATA-{}", i);
        let got = read_value(h, key.as_bytes(), &mut buf).unwrap();
        assert_eq!(got, expected.as_bytes());
    }
    close(h).unwrap();

    let h2 = open_db(&path, false, 128, 8028, 510);
    for i in 0..300 {
        let key = format!("Key_in_loop_{}_{}", i, i * i);
        let expected = format!("DATA-{}", i);
        let got = read_value(h2, key.as_bytes(), &mut buf).unwrap();
        assert_eq!(got, expected.as_bytes());
    }
    close(h2).unwrap();
}

// E2: starting from an E1-shaped state, delete the first five keys and
// confirm the split between deleted and live keys survives a reopen.
#[test]
fn e2_delete_subset_then_reopen_durability() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("e2.kdb");

    let h = open_db(&path, true, 128, 8028, 510);
    for i in 0..300 {
        let key = format!("Key_in_loop_{}_{}", i, i * i);
        let value = format!("DATA-{}", i);
        write_key(h, Purpose::Db, key.as_bytes(), value.as_bytes()).unwrap();
    }

    for i in 0..5 {
        let key = format!("Key_in_loop_{}_{}", i, i * i);
        delete_key(h, Purpose::Db, key.as_bytes()).unwrap();
    }

    let mut buf = vec![0u8; 8028];
    for i in 0..5 {
        let key = format!("Key_in_loop_{}_{}", i, i * i);
        assert!(matches!(read_value(h, key.as_bytes(), &mut buf), Err(DbError::NotFound)));
    }
    for i in 6..299 {
        let key = format!("Key_in_loop_{}_{}", i, i * i);
        let expected = format!("DATA-{}", i);
        assert_eq!(read_value(h, key.as_bytes(), &mut buf).unwrap(), expected.as_bytes());
    }
    close(h).unwrap();

    let h2 = open_db(&path, false, 128, 8028, 510);
    for i in 0..5 {
        let key = format!("Key_in_loop_{}_{}", i, i * i);
        assert!(matches!(read_value(h2, key.as_bytes(), &mut buf), Err(DbError::NotFound)));
    }
    for i in 6..299 {
        let key = format!("Key_in_loop_{}_{}", i, i * i);
        let expected = format!("DATA-{}", i);
        assert_eq!(read_value(h2, key.as_bytes(), &mut buf).unwrap(), expected.as_bytes());
    }
    close(h2).unwrap();
}

// E3: flip a byte inside one data block's value area of an already cleanly
// closed file. The selected block's CRC now fails, so the read must fall
// back to the backup block and keep serving the correct (pre-corruption)
// value; every other key must still read correctly too.
#[test]
fn e3_corrupted_current_block_heals_from_backup() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("e3.kdb");

    let key: &[u8] = b"FAULTINJECTKEY01";
    let value: &[u8] = b"ORIGINAL_VALUE01";
    let other_key: &[u8] = b"SIDEKICKKEY_ABCD";
    let other_value: &[u8] = b"SIDEKICK_VALUE01";
    assert_eq!(key.len(), 16);
    assert_eq!(value.len(), 16);

    let h = open_db(&path, true, 16, 16, 8);
    write_key(h, Purpose::Db, key, value).unwrap();
    write_key(h, Purpose::Db, other_key, other_value).unwrap();
    close(h).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let hits = find_all(&bytes, key);
    assert_eq!(hits.len(), 2, "expected the key to appear once in block A and once in block B");
    // Block layout: start(8) | crc(8) | key(16) | vlen(4) | value(16) | ... --
    // the key sits at block_start + 16, so the value starts 16 + 4 bytes
    // after the key's own offset. The lower file address is always block A.
    let key_off = hits[0];
    let value_off = key_off + 16 + 4;
    bytes[value_off] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let h2 = open_db(&path, false, 16, 16, 8);
    let mut buf = [0u8; 16];
    let got = read_value(h2, key, &mut buf).unwrap();
    assert_eq!(got, value, "self-healed read must still return the original value");
    let got_other = read_value(h2, other_key, &mut buf).unwrap();
    assert_eq!(got_other, other_value);
    close(h2).unwrap();
}

// E4: corrupt the CRC field of hash-table page 0 in an already cleanly
// closed file. The next open must still recover every key via the
// blind-scan rebuild, even though the close flags never flagged a problem.
#[test]
fn e4_corrupted_hashtable_page_crc_triggers_rebuild() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("e4.kdb");

    let h = open_db(&path, true, 16, 16, 8);
    let mut written = Vec::new();
    for i in 0..20 {
        let key = format!("key-{:04}---------", i);
        let key = key.as_bytes()[..16].to_vec();
        let value = format!("val-{:04}---------", i);
        let value = value.as_bytes()[..16].to_vec();
        write_key(h, Purpose::Db, &key, &value).unwrap();
        written.push((key, value));
    }
    close(h).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    // Page 0 starts right after the header; its stored CRC occupies the 8
    // bytes right after the 8-byte start delimiter (spec §6).
    let crc_off = (HEADER_SIZE + 8) as usize;
    bytes[crc_off] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let h2 = open_db(&path, false, 16, 16, 8);
    let mut buf = [0u8; 16];
    for (key, value) in &written {
        let got = read_value(h2, key, &mut buf).unwrap();
        assert_eq!(&got, value);
    }
    close(h2).unwrap();
}

// E5: two handles opened on the same write-through database observe each
// other's writes without either one being closed in between.
#[test]
fn e5_two_handles_see_each_others_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("e5.kdb");

    let h1 = open_db(&path, true, 16, 16, 8);
    let h2 = open_db(&path, false, 16, 16, 8);

    write_key(h1, Purpose::Db, b"alpha", b"one").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(read_value(h2, b"alpha", &mut buf).unwrap(), b"one");

    write_key(h2, Purpose::Db, b"beta", b"two").unwrap();
    assert_eq!(read_value(h1, b"beta", &mut buf).unwrap(), b"two");

    close(h1).unwrap();
    close(h2).unwrap();
}

// E6: listing completeness and buffer sizing (properties 7 and 8).
#[test]
fn e6_listing_completeness_and_buffer_size() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("e6.kdb");

    let h = open_db(&path, true, 16, 16, 8);
    write_key(h, Purpose::Db, b"k1", b"v1").unwrap();
    write_key(h, Purpose::Db, b"k2", b"v2").unwrap();
    write_key(h, Purpose::Db, b"k3", b"v3").unwrap();

    let size = list_size(h, Purpose::Db).unwrap();
    // Three 2-byte logical keys, each with a trailing NUL separator -- no
    // padding to the 16-byte on-disk key buffer should leak into the listing.
    assert_eq!(size, 9);

    let mut buf = vec![0u8; size];
    let n = list_keys(h, Purpose::Db, &mut buf).unwrap();
    assert_eq!(n, size);
    let listing = &buf[..n];
    assert_eq!(listing.last(), Some(&0), "listing must end with a trailing NUL");

    // Splitting on NUL must yield exactly the three logical keys plus one
    // empty tail fragment from the trailing separator -- no interior empty
    // fragments, which is what zero-padding leaking into the listing would
    // produce.
    let mut fragments: Vec<Vec<u8>> = listing.split(|&b| b == 0).map(|f| f.to_vec()).collect();
    assert_eq!(fragments.pop(), Some(Vec::new()));
    let fragments: std::collections::BTreeSet<Vec<u8>> = fragments.into_iter().collect();
    let expected: std::collections::BTreeSet<Vec<u8>> =
        [b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()].into_iter().collect();
    assert_eq!(fragments, expected);

    close(h).unwrap();
}

// Invariant 7, cached mode: a cached `Delete` of a file-resident key must
// shadow it in the listing, and a cached `Write` overlaying an existing file
// key must not be counted twice.
#[test]
fn cached_delete_and_overwrite_shadow_file_listing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cached-listing.kdb");

    let h1 = open_db(&path, true, 16, 16, 8);
    write_key(h1, Purpose::Db, b"k1", b"v1").unwrap();
    write_key(h1, Purpose::Db, b"k2", b"v2").unwrap();
    close(h1).unwrap();

    let h2 = open_cached_db(&path, false, 16, 16, 8);
    delete_key(h2, Purpose::Db, b"k1").unwrap();
    write_key(h2, Purpose::Db, b"k2", b"v2-updated").unwrap();

    let size = list_size(h2, Purpose::Db).unwrap();
    let mut buf = vec![0u8; size];
    let n = list_keys(h2, Purpose::Db, &mut buf).unwrap();
    let mut fragments: Vec<Vec<u8>> = buf[..n].split(|&b| b == 0).map(|f| f.to_vec()).collect();
    assert_eq!(fragments.pop(), Some(Vec::new()));
    assert_eq!(fragments, vec![b"k2".to_vec()], "k1 must be shadowed and k2 must appear exactly once");

    close(h2).unwrap();
}

// Property 6: a delete followed by a write of a distinct value to the same
// key must reuse the tombstoned block pair rather than growing the file.
#[test]
fn tombstone_reuse_does_not_grow_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reuse.kdb");

    let h = open_db(&path, true, 16, 16, 8);
    write_key(h, Purpose::Db, b"reused-key", b"first-value-0001").unwrap();
    let len_after_first = fs::metadata(&path).unwrap().len();

    delete_key(h, Purpose::Db, b"reused-key").unwrap();
    write_key(h, Purpose::Db, b"reused-key", b"second-value-002").unwrap();
    let len_after_second = fs::metadata(&path).unwrap().len();

    assert_eq!(len_after_first, len_after_second);

    let mut buf = [0u8; 16];
    assert_eq!(read_value(h, b"reused-key", &mut buf).unwrap(), b"second-value-002");
    close(h).unwrap();
}

// Property 5: a write torn mid-overwrite (the "currently selected" block is
// damaged, the backup still holds the pre-write value) must recover to a
// real, previously-committed value -- never garbage, never another key's
// value -- the next time the database is opened.
#[test]
fn crash_mid_overwrite_recovers_to_a_prior_value() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.kdb");

    let h = open_db(&path, true, 16, 16, 8);
    write_key(h, Purpose::Db, b"crash-key-0000--", b"value-before-001").unwrap();
    write_key(h, Purpose::Db, b"other-key-0000--", b"other-value-0001").unwrap();
    // Deliberately not closed: the header's close-failed/close-ok flags
    // stay exactly as `open` set them, matching a process killed mid-run.

    let mut bytes = fs::read(&path).unwrap();
    let hits = find_all(&bytes, b"crash-key-0000--");
    assert_eq!(hits.len(), 2);
    // Lower address is block A; a fresh insert's selector is A, so A is
    // the "currently selected" block an in-flight overwrite would touch
    // first under this engine's write order (see DESIGN.md "Overwrite
    // write order"). Torn-write it so its CRC can no longer verify, while
    // block B (the backup, lower in the chain of custody here) still
    // holds the last value that was fully committed.
    let current_key_off = hits[0];
    let current_value_off = current_key_off + 16 + 4;
    bytes[current_value_off] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    // `h` is still registered as an open handle (never closed), so it
    // cannot be reused for the post-crash open: simulate a second process
    // attaching to the same file after the crash.
    let h2 = open_db(&path, false, 16, 16, 8);
    let mut buf = [0u8; 16];
    let got = read_value(h2, b"crash-key-0000--", &mut buf).unwrap();
    assert_eq!(got, b"value-before-001", "recovery must land on a real, previously-committed value");
    let got_other = read_value(h2, b"other-key-0000--", &mut buf).unwrap();
    assert_eq!(got_other, b"other-value-0001");
    close(h2).unwrap();
}

//! End-to-end pack family scenarios.

use std::io::Seek;
use std::path::Path;

use spak::pack::{format, PackOptions, Packager};
use spak::xml::{Document, PrintMode};
use tempfile::tempdir;

/// Deterministic pseudo-random payloads (xorshift-multiply LCG).
fn random_bytes(seed: u64, n: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) as u8
        })
        .collect()
}

/// Open an entry, fill its stream, and queue it for the next write.
fn stage(pak: &Packager, path: &str, data: &[u8]) {
    let entry = pak.open_file(path).unwrap();
    entry
        .waitable()
        .with_stream(|s| s.write_aligned(data, 1))
        .unwrap()
        .unwrap();
    pak.submit(path).unwrap();
}

fn read_header(path: &Path) -> (Vec<u8>, u32) {
    let raw = std::fs::read(path).unwrap();
    let itab_off = u32::from_le_bytes(raw[8..12].try_into().unwrap());
    (raw, itab_off)
}

// A single small file survives a write/reopen/read cycle.
#[test]
fn single_file_roundtrip() {
    let dir = tempdir().unwrap();
    let family = dir.path().join("fam.spk");
    let payload = b"Hello, world!\n";

    {
        let pak = Packager::open_with(
            &family,
            PackOptions::default().with_cap(1 << 20).with_workers(1),
        )
        .unwrap();
        stage(&pak, "a.txt", payload);
        pak.write().unwrap();
    }

    assert!(family.exists());
    assert!(!dir.path().join("fam_1.spk").exists());

    let (raw, itab_off) = read_header(&family);
    assert_eq!(&raw[..4], &[0x53, 0x50, 0x4B, 0x7F]);
    assert_eq!(raw[4], 2, "major version");
    assert_eq!(raw[5], 0, "minor version");
    assert_eq!(raw[6], 0, "member id");
    assert!(itab_off >= 32 && (itab_off as usize) < raw.len());

    let pak = Packager::open(&family).unwrap();
    let entry = pak.entry("a.txt").unwrap();
    assert_eq!(entry.original_size(), 14);
    assert!(entry.compressed_size() <= 64);
    assert_eq!(pak.read_file("a.txt").unwrap(), payload);
}

// A small cap forces the family to split into multiple members.
#[test]
fn splits_into_members_under_small_cap() {
    let dir = tempdir().unwrap();
    let family = dir.path().join("fam.spk");
    let cap = 400u64;
    let payloads: Vec<(String, Vec<u8>)> = ["x", "y", "z"]
        .iter()
        .enumerate()
        .map(|(i, name)| ((*name).to_owned(), random_bytes(1 + i as u64, 200)))
        .collect();

    {
        let pak =
            Packager::open_with(&family, PackOptions::default().with_cap(cap).with_workers(2))
                .unwrap();
        for (name, data) in &payloads {
            stage(&pak, name, data);
        }
        pak.write().unwrap();
    }

    // Incompressible 200-byte payloads cannot share a 400-byte member.
    assert!(family.exists());
    assert!(dir.path().join("fam_1.spk").exists());

    // Property: every member respects the cap and carries a valid index.
    for mid in 0..=255u16 {
        let path = if mid == 0 {
            family.clone()
        } else {
            dir.path().join(format!("fam_{mid}.spk"))
        };
        if !path.exists() {
            break;
        }
        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size <= cap, "member {mid} is {size} bytes, cap {cap}");

        let (raw, itab_off) = read_header(&path);
        let records = format::decode_itab(&raw[itab_off as usize..]).unwrap();
        assert!(!records.is_empty());
        for r in &records {
            assert!(u64::from(r.off) + u64::from(r.compressed) <= u64::from(itab_off));
        }
    }

    // Submission order is preserved within each member.
    let pak = Packager::open(&family).unwrap();
    let infos = pak.list();
    let position =
        |name: &str| infos.iter().position(|i| i.path == name).unwrap();
    for pair in ["x", "y", "z"].windows(2) {
        let (a, b) = (&infos[position(pair[0])], &infos[position(pair[1])]);
        if a.member_id == b.member_id {
            assert!(a.off < b.off);
        } else {
            assert!(a.member_id < b.member_id);
        }
    }

    for (name, data) in &payloads {
        assert_eq!(&pak.read_file(name).unwrap(), data);
    }
}

// An entry whose compressed payload alone exceeds the cap is fatal.
#[test]
fn oversized_entry_fails_and_leaves_member_recoverable() {
    let dir = tempdir().unwrap();
    let family = dir.path().join("fam.spk");

    let pak = Packager::open_with(
        &family,
        PackOptions::default().with_cap(100).with_workers(1),
    )
    .unwrap();
    stage(&pak, "big.bin", &random_bytes(7, 10 * 1024));
    let err = pak.write().unwrap_err();
    assert!(matches!(err, spak::Error::EntryTooLarge { .. }));
    drop(pak);

    // The open member was never sealed: header present, index offset 0.
    let (raw, itab_off) = read_header(&family);
    assert_eq!(&raw[..4], b"SPK\x7f");
    assert_eq!(itab_off, 0);

    // Recoverable: the family reopens as empty.
    let pak = Packager::open(&family).unwrap();
    assert!(pak.list().is_empty());
}

// Entries fetch correctly after close and reopen.
#[test]
fn fetch_after_reopen() {
    let dir = tempdir().unwrap();
    let family = dir.path().join("fam.spk");
    let p = random_bytes(21, 3000);
    let q = random_bytes(22, 100);

    {
        let pak = Packager::open(&family).unwrap();
        stage(&pak, "p", &p);
        stage(&pak, "q", &q);
        pak.write().unwrap();
        pak.close();
    }

    let pak = Packager::open(&family).unwrap();
    let entry = pak.open_file("p").unwrap();
    assert!(entry.is_active());

    let waitable = entry.waitable();
    waitable.wait();
    let got = waitable
        .with_stream(|s| {
            s.seek(std::io::SeekFrom::Start(0)).unwrap();
            s.read_remaining().unwrap()
        })
        .unwrap();
    assert_eq!(got, p);

    assert!(entry.release());
    assert!(!entry.is_active());
    // Metadata survives release.
    assert!(entry.is_indexed());
    assert_eq!(entry.original_size() as usize, p.len());

    assert_eq!(pak.read_file("q").unwrap(), q);
}

// Concurrent fetches of many distinct entries are all correct.
#[test]
fn concurrent_fetch_correctness() {
    let dir = tempdir().unwrap();
    let family = dir.path().join("fam.spk");
    let payloads: Vec<(String, Vec<u8>)> = (0..16)
        .map(|i| (format!("blob_{i:02}"), random_bytes(100 + i as u64, 8 * 1024)))
        .collect();

    {
        let pak = Packager::open_with(&family, PackOptions::default().with_workers(4)).unwrap();
        for (name, data) in &payloads {
            stage(&pak, name, data);
        }
        pak.write().unwrap();
    }

    let pak = Packager::open_with(&family, PackOptions::default().with_workers(4)).unwrap();
    let entries = pak
        .open_files(payloads.iter().map(|(name, _)| name.as_str()))
        .unwrap();

    for (entry, (name, data)) in entries.iter().zip(&payloads) {
        let waitable = entry.waitable();
        let got = waitable
            .with_stream(|s| {
                s.seek(std::io::SeekFrom::Start(0)).unwrap();
                s.read_remaining().unwrap()
            })
            .unwrap();
        assert_eq!(&got, data, "payload mismatch for {name}");
    }
    assert_eq!(pak.pending_fetches(), 0);
}

// The structured index document survives print/parse round trips.
#[test]
fn structured_index_roundtrip() {
    let mut doc = Document::new();
    let root = doc.create_element("SPK").unwrap();
    doc.set_root(root);
    for (name, off, size, original) in [
        ("a.txt", 32u32, 40u32, 14u32),
        ("dir/b.bin", 72, 900, 4096),
        ("c", 972, 10, 3),
    ] {
        let file = doc.create_element("file").unwrap();
        doc.set_attr(file, "name", name);
        doc.set_attr(file, "off", off.to_string());
        doc.set_attr(file, "size", size.to_string());
        doc.set_attr(file, "original", original.to_string());
        doc.append_child(root, file);
    }

    let printed = doc.print(PrintMode::Formatted).unwrap();
    let back = Document::parse(&printed).unwrap();
    let back_root = back.root().unwrap();
    assert_eq!(back.tag(back_root), "SPK");

    let orig_children = doc.children(root);
    let back_children = back.children(back_root);
    assert_eq!(orig_children.len(), back_children.len());
    for (a, b) in orig_children.iter().zip(back_children) {
        assert_eq!(doc.attrs(*a), back.attrs(*b), "attribute lists diverge");
    }
}

// A member's index is readable in the structured encoding too.
#[test]
fn document_encoded_itab_is_accepted() {
    let records = vec![
        format::ItabRecord {
            path: "one".into(),
            off: 32,
            compressed: 10,
            original: 10,
        },
        format::ItabRecord {
            path: "two".into(),
            off: 42,
            compressed: 20,
            original: 64,
        },
    ];
    let text = format::itab_document_text(&records).unwrap();
    let decoded = format::decode_itab(text.as_bytes()).unwrap();
    assert_eq!(decoded, records);
}

// Directory ingest and extraction reproduce the tree byte-for-byte.
#[test]
fn open_dir_extract_all_roundtrip() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(src.join("nested/deep")).unwrap();
    std::fs::write(src.join("top.txt"), b"top level").unwrap();
    std::fs::write(src.join("nested/mid.bin"), random_bytes(5, 2048)).unwrap();
    std::fs::write(src.join("nested/deep/leaf.dat"), random_bytes(6, 512)).unwrap();

    let family = dir.path().join("fam.spk");
    {
        let pak = Packager::open(&family).unwrap();
        let opened = pak.open_dir(&src).unwrap();
        assert_eq!(opened.len(), 3);
        pak.write().unwrap();
    }

    let out = dir.path().join("out");
    let pak = Packager::open(&family).unwrap();
    assert_eq!(pak.extract_all(&out).unwrap(), 3);

    for rel in ["top.txt", "nested/mid.bin", "nested/deep/leaf.dat"] {
        let original = std::fs::read(src.join(rel)).unwrap();
        let extracted = std::fs::read(out.join(rel)).unwrap();
        assert_eq!(original, extracted, "mismatch for {rel}");
    }
}

// Rewriting a family replaces members wholesale.
#[test]
fn rewrite_replaces_previous_contents() {
    let dir = tempdir().unwrap();
    let family = dir.path().join("fam.spk");

    {
        let pak = Packager::open(&family).unwrap();
        stage(&pak, "keep", b"version one");
        pak.write().unwrap();
    }
    {
        let pak = Packager::open(&family).unwrap();
        assert_eq!(pak.read_file("keep").unwrap(), b"version one");
        stage(&pak, "keep", b"version two, longer than before");
        pak.write().unwrap();
    }

    let pak = Packager::open(&family).unwrap();
    assert_eq!(
        pak.read_file("keep").unwrap(),
        b"version two, longer than before"
    );
}

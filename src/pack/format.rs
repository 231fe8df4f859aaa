//! On-disk SPK member layout: header and index table codecs.
//!
//! All multi-byte integers are little-endian. A member is:
//!
//! ```text
//! 0       4   magic "SPK\x7f"
//! 4       1   major version (2)
//! 5       1   minor version (0)
//! 6       1   member id
//! 7       1   reserved
//! 8       4   itab offset (u32, within this file)
//! 12      20  reserved
//! 32      ..  concatenated compressed payloads (codec frames)
//! itab    ..  index records to EOF
//! ```
//!
//! The index table is normally the compact binary record list; a
//! structured-document form (root `SPK`, `file` children) is accepted on
//! read for human-edited indices and offered by [`itab_to_document`] for
//! inspection tooling.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::xml::{Document, PrintMode};

/// Member file magic.
pub const MAGIC: [u8; 4] = [b'S', b'P', b'K', 0x7F];
/// Current major format version.
pub const VERSION_MAJOR: u8 = 2;
/// Current minor format version.
pub const VERSION_MINOR: u8 = 0;
/// Fixed member header size.
pub const HEADER_SIZE: u64 = 32;
/// Byte offset of the itab-offset field inside the header.
pub const ITAB_OFFSET_FIELD: u64 = 8;
/// Fixed bytes of an itab record before the path.
pub const ITAB_RECORD_BASE: u64 = 14;
/// Default per-member size cap.
pub const DEFAULT_PACK_CAP: u64 = (1 << 30) - 1;
/// Highest member id a family can use.
pub const MAX_MEMBER_ID: u8 = u8::MAX;

/// Parsed member header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberHeader {
    /// Member id (0 = `base.ext`, n = `base_n.ext`).
    pub member_id: u8,
    /// Offset of the index table, or 0 for an unsealed (empty) member.
    pub itab_offset: u32,
}

impl MemberHeader {
    /// Serialize the fixed 32-byte header.
    ///
    /// # Errors
    /// Returns [`Error::Io`] on a write failure.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&MAGIC)?;
        w.write_u8(VERSION_MAJOR)?;
        w.write_u8(VERSION_MINOR)?;
        w.write_u8(self.member_id)?;
        w.write_u8(0)?;
        w.write_u32::<LittleEndian>(self.itab_offset)?;
        w.write_all(&[0u8; 20])?;
        Ok(())
    }

    /// Parse and validate a member header.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMagic`] or [`Error::UnsupportedVersion`] for
    /// foreign or v1 files, [`Error::Io`] on short reads.
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let major = r.read_u8()?;
        let minor = r.read_u8()?;
        if major != VERSION_MAJOR {
            return Err(Error::UnsupportedVersion { major, minor });
        }
        let member_id = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let itab_offset = r.read_u32::<LittleEndian>()?;
        let mut reserved = [0u8; 20];
        r.read_exact(&mut reserved)?;
        Ok(MemberHeader {
            member_id,
            itab_offset,
        })
    }
}

/// One index record: where a file's compressed payload lives inside its
/// member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItabRecord {
    /// Entry path (unique within the family).
    pub path: String,
    /// Payload offset within the member file.
    pub off: u32,
    /// Compressed payload size.
    pub compressed: u32,
    /// Uncompressed size.
    pub original: u32,
}

impl ItabRecord {
    /// Encoded size of this record in the binary itab.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        ITAB_RECORD_BASE + self.path.len() as u64
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let len = u16::try_from(self.path.len())
            .map_err(|_| Error::InvalidPath(self.path.clone()))?;
        w.write_u16::<LittleEndian>(len)?;
        w.write_all(self.path.as_bytes())?;
        w.write_u32::<LittleEndian>(self.off)?;
        w.write_u32::<LittleEndian>(self.compressed)?;
        w.write_u32::<LittleEndian>(self.original)?;
        Ok(())
    }
}

/// Serialize records as the compact binary itab.
#[must_use]
pub fn encode_itab(records: &[ItabRecord]) -> Vec<u8> {
    let total: u64 = records.iter().map(ItabRecord::encoded_len).sum();
    let mut out = Vec::with_capacity(total as usize);
    for record in records {
        // Writing into a Vec cannot fail; path length was validated when
        // the record was built.
        record.write(&mut out).expect("vec write");
    }
    out
}

/// Decode an itab in either encoding.
///
/// The structured-document form is selected when the first byte is `<`;
/// everything else is parsed as binary records that must consume the input
/// exactly.
///
/// # Errors
/// Returns [`Error::MalformedItab`] on any decode failure.
pub fn decode_itab(bytes: &[u8]) -> Result<Vec<ItabRecord>> {
    if bytes.first() == Some(&b'<') {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::MalformedItab(format!("index document not UTF-8: {e}")))?;
        let doc = Document::parse(text)
            .map_err(|e| Error::MalformedItab(format!("index document: {e}")))?;
        return itab_from_document(&doc);
    }
    decode_binary_itab(bytes)
}

fn decode_binary_itab(bytes: &[u8]) -> Result<Vec<ItabRecord>> {
    let mut cur = bytes;
    let mut records = Vec::new();
    while !cur.is_empty() {
        if cur.len() < 2 {
            return Err(Error::MalformedItab("truncated record length".into()));
        }
        let len = u16::from_le_bytes([cur[0], cur[1]]) as usize;
        cur = &cur[2..];
        if cur.len() < len + 12 {
            return Err(Error::MalformedItab(format!(
                "record needs {} bytes, {} remain",
                len + 12,
                cur.len()
            )));
        }
        let path = std::str::from_utf8(&cur[..len])
            .map_err(|e| Error::MalformedItab(format!("path not UTF-8: {e}")))?
            .to_owned();
        cur = &cur[len..];
        let off = u32::from_le_bytes(cur[0..4].try_into().unwrap());
        let compressed = u32::from_le_bytes(cur[4..8].try_into().unwrap());
        let original = u32::from_le_bytes(cur[8..12].try_into().unwrap());
        cur = &cur[12..];
        records.push(ItabRecord {
            path,
            off,
            compressed,
            original,
        });
    }
    Ok(records)
}

/// Build the structured-document form of an itab (root `SPK`, one `file`
/// child per record with `name`/`off`/`size`/`original` attributes).
#[must_use]
pub fn itab_to_document(records: &[ItabRecord]) -> Document {
    let mut doc = Document::new();
    let root = doc.create_element("SPK").expect("fresh arena");
    doc.set_root(root);
    for record in records {
        let file = doc.create_element("file").expect("fresh arena");
        doc.set_attr(file, "name", record.path.clone());
        doc.set_attr(file, "off", record.off.to_string());
        doc.set_attr(file, "size", record.compressed.to_string());
        doc.set_attr(file, "original", record.original.to_string());
        doc.append_child(root, file);
    }
    doc
}

/// Decode the structured-document form of an itab.
///
/// # Errors
/// Returns [`Error::MalformedItab`] if the root tag, child tags, or
/// attribute values do not match the schema.
pub fn itab_from_document(doc: &Document) -> Result<Vec<ItabRecord>> {
    let root = doc
        .root()
        .ok_or_else(|| Error::MalformedItab("index document has no root".into()))?;
    if doc.tag(root) != "SPK" {
        return Err(Error::MalformedItab(format!(
            "unexpected root tag <{}>",
            doc.tag(root)
        )));
    }
    let mut records = Vec::with_capacity(doc.children(root).len());
    for child in doc.children(root) {
        if doc.tag(*child) != "file" {
            return Err(Error::MalformedItab(format!(
                "unexpected element <{}>",
                doc.tag(*child)
            )));
        }
        let attr = |name: &str| {
            doc.attr(*child, name)
                .ok_or_else(|| Error::MalformedItab(format!("file element missing `{name}`")))
        };
        let number = |name: &str| -> Result<u32> {
            attr(name)?
                .parse()
                .map_err(|_| Error::MalformedItab(format!("bad numeric `{name}`")))
        };
        records.push(ItabRecord {
            path: attr("name")?.to_owned(),
            off: number("off")?,
            compressed: number("size")?,
            original: number("original")?,
        });
    }
    Ok(records)
}

/// Render the structured-document itab as text (for inspection tooling).
///
/// # Errors
/// Returns [`Error::IndexDoc`] if the document cannot be printed.
pub fn itab_document_text(records: &[ItabRecord]) -> Result<String> {
    Ok(itab_to_document(records).print(PrintMode::Formatted)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<ItabRecord> {
        vec![
            ItabRecord {
                path: "textures/rock.dds".into(),
                off: 32,
                compressed: 900,
                original: 4096,
            },
            ItabRecord {
                path: "a.txt".into(),
                off: 932,
                compressed: 20,
                original: 14,
            },
        ]
    }

    #[test]
    fn header_roundtrip() {
        let header = MemberHeader {
            member_id: 7,
            itab_offset: 0x1234,
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE as usize);
        assert_eq!(&buf[..4], &MAGIC);
        assert_eq!(buf[4], 2);
        assert_eq!(buf[5], 0);
        assert_eq!(buf[6], 7);

        let back = MemberHeader::read(&mut buf.as_slice()).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn foreign_magic_rejected() {
        let mut buf = Vec::new();
        MemberHeader {
            member_id: 0,
            itab_offset: 0,
        }
        .write(&mut buf)
        .unwrap();
        buf[0] = b'Z';
        assert!(matches!(
            MemberHeader::read(&mut buf.as_slice()),
            Err(Error::InvalidMagic)
        ));
    }

    #[test]
    fn v1_header_rejected() {
        let mut buf = Vec::new();
        MemberHeader {
            member_id: 0,
            itab_offset: 64,
        }
        .write(&mut buf)
        .unwrap();
        buf[4] = 1;
        assert!(matches!(
            MemberHeader::read(&mut buf.as_slice()),
            Err(Error::UnsupportedVersion { major: 1, .. })
        ));
    }

    #[test]
    fn binary_itab_roundtrip() {
        let records = sample_records();
        let bytes = encode_itab(&records);
        let expected: u64 = records.iter().map(ItabRecord::encoded_len).sum();
        assert_eq!(bytes.len() as u64, expected);
        assert_eq!(decode_itab(&bytes).unwrap(), records);
    }

    #[test]
    fn truncated_itab_is_malformed() {
        let bytes = encode_itab(&sample_records());
        assert!(matches!(
            decode_itab(&bytes[..bytes.len() - 3]),
            Err(Error::MalformedItab(_))
        ));
    }

    #[test]
    fn document_itab_roundtrip() {
        let records = sample_records();
        let text = itab_document_text(&records).unwrap();
        // `decode_itab` sniffs the document form from the leading `<`; the
        // XML declaration is skipped by the parser.
        let back = decode_itab(text.as_bytes()).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn document_itab_rejects_wrong_schema() {
        assert!(matches!(
            decode_itab(b"<SPK><blob name=\"x\"/></SPK>"),
            Err(Error::MalformedItab(_))
        ));
        assert!(matches!(
            decode_itab(b"<PAK></PAK>"),
            Err(Error::MalformedItab(_))
        ));
    }
}

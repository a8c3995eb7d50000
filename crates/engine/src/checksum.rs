//! Kind-aware content normalization and hashing.
//!
//! The depot stores text canonically: LF line endings, and UTF-8 without a
//! byte-order mark for UTF-16 files. Local content is normalized the same way
//! before it is sized or hashed, so that a local [`FileRecord`] compares equal
//! to the depot's record of the same content.

use crate::error::{ErrorKind, Result};
use depotsync_depot::{FileKind, FileRecord, FileType};
use encoding_rs::{Encoding, UTF_16LE};
use exn::ResultExt;
use md5::{Digest, Md5};
use std::borrow::Cow;
use std::fmt::Write as _;
use std::path::Path;

/// Canonical depot bytes of client-side `content`.
pub fn normalize(kind: FileKind, content: &[u8]) -> Cow<'_, [u8]> {
    match kind {
        FileKind::Binary => Cow::Borrowed(content),
        FileKind::Text | FileKind::UnicodeMultibyte => match content.windows(2).any(|w| w == b"\r\n") {
            true => Cow::Owned(strip_carriage_returns(content)),
            false => Cow::Borrowed(content),
        },
        FileKind::Utf16 => {
            // Without a byte-order mark the client wrote little-endian.
            let (encoding, bom) = Encoding::for_bom(content).unwrap_or((UTF_16LE, 0));
            let (text, _) = encoding.decode_without_bom_handling(&content[bom..]);
            let text = text.trim_start_matches('\u{feff}').replace("\r\n", "\n");
            Cow::Owned(text.into_bytes())
        },
    }
}

fn strip_carriage_returns(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len());
    let mut bytes = content.iter().peekable();
    while let Some(b) = bytes.next() {
        if *b == b'\r' && bytes.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(*b);
    }
    out
}

/// Uppercase hex MD5, matching the depot's digest notation.
pub fn digest(content: &[u8]) -> String {
    Md5::digest(content).iter().fold(String::with_capacity(32), |mut acc, b| {
        let _ = write!(acc, "{b:02X}");
        acc
    })
}

/// Best guess at the kind of a file the depot doesn't know yet.
pub fn infer_kind(content: &[u8]) -> FileKind {
    match content {
        [0xFF, 0xFE, ..] | [0xFE, 0xFF, ..] => FileKind::Utf16,
        _ if std::str::from_utf8(content).is_ok() => FileKind::Text,
        _ => FileKind::Binary,
    }
}

/// Normalized size and, optionally, digest of canonical `content`.
pub fn measure(kind: FileKind, content: &[u8], checksum: bool) -> (u64, String) {
    let normalized = normalize(kind, content);
    let digest = match checksum {
        true => digest(&normalized),
        false => String::new(),
    };
    (normalized.len() as u64, digest)
}

/// Describe a local file as the depot would, given the depot's file type.
///
/// The digest stays empty unless `checksum` is set. The normalized buffer is
/// dropped before this returns.
pub fn local_record(
    local: impl AsRef<Path>,
    depot_path: impl Into<String>,
    file_type: FileType,
    checksum: bool,
) -> Result<FileRecord> {
    let local = local.as_ref();
    let content = std::fs::read(local).or_raise(|| ErrorKind::LocalFiles)?;
    let (size, digest) = measure(file_type.kind(), &content, checksum);
    Ok(FileRecord::new(depot_path, file_type).with_size(size).with_digest(digest).with_local_path(local))
}

/// Like [`local_record`] for a file the depot has no type for: the kind is
/// inferred from the content and the digest is always computed.
pub fn untyped_local_record(local: impl AsRef<Path>, depot_path: impl Into<String>) -> Result<FileRecord> {
    let local = local.as_ref();
    let content = std::fs::read(local).or_raise(|| ErrorKind::LocalFiles)?;
    let kind = infer_kind(&content);
    let (size, digest) = measure(kind, &content, true);
    Ok(FileRecord::new(depot_path, kind).with_size(size).with_digest(digest).with_local_path(local))
}

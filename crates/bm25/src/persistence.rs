//! On-disk binary format for a single knowledge base's [`InvertedIndex`].
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic        4 bytes   b"KBI1"
//! format_ver   u16
//! tokenizer_ver u32
//! num_docs     u32
//! avg_doc_len  f32  (redundant with postings, stored for O(1) reload)
//! doc_table_len u32
//! doc_table    [ (surrogate: u32, chunk_id_len: u16, chunk_id: bytes, doc_len: u32) ]
//! term_table_len u32
//! term_table   [ (term_len: u16, term: bytes, df: u32, postings_len: u32,
//!                 postings: [ (surrogate: u32, tf: u32) ] ) ]
//! checksum     u64  (FNV-1a over every byte preceding this field)
//! ```
//!
//! A `format_ver` or `tokenizer_ver` mismatch against the running binary's
//! [`FORMAT_VERSION`]/configured `tokenizer_version` is treated as "no usable
//! index on disk" by [`crate::manager`] — it rebuilds from the repository
//! rather than attempting to migrate bytes in place.

use crate::index::InvertedIndex;
use kbretrieve_common::errors::{RetrievalError, Result};
use kbretrieve_types::{ChunkId, KbId};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u16 = 1;
const MAGIC: &[u8; 4] = b"KBI1";

pub fn index_path(index_dir: &Path, kb_id: &KbId) -> PathBuf {
    index_dir.join(format!("{}.bm25", kb_id.as_str()))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn corrupt(kb_id: &KbId, message: impl Into<String>) -> RetrievalError {
    RetrievalError::IndexCorrupt {
        kb_id: kb_id.clone(),
        message: message.into(),
    }
}

/// Serialize `index` to `path`, tagging it with `tokenizer_version`.
///
/// Writes to a `.tmp` sibling then renames, so a crash mid-write never
/// leaves a half-written file at `path`.
pub fn save(index: &InvertedIndex, path: &Path, tokenizer_version: u32) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&tokenizer_version.to_le_bytes());
    buf.extend_from_slice(&index.num_docs().to_le_bytes());
    buf.extend_from_slice(&index.avg_doc_length().to_le_bytes());

    let chunk_ids = index.chunk_ids_snapshot();
    let doc_lengths = index.doc_lengths_snapshot();
    buf.extend_from_slice(&(chunk_ids.len() as u32).to_le_bytes());
    for (surrogate, chunk_id) in chunk_ids.iter().enumerate() {
        let id_bytes = chunk_id.as_str().as_bytes();
        buf.extend_from_slice(&(surrogate as u32).to_le_bytes());
        buf.extend_from_slice(&(id_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(id_bytes);
        let doc_len = doc_lengths.get(&(surrogate as u32)).copied().unwrap_or(0);
        buf.extend_from_slice(&doc_len.to_le_bytes());
    }

    let postings = index.postings_snapshot();
    buf.extend_from_slice(&(postings.len() as u32).to_le_bytes());
    for (term, posting_list) in postings {
        let term_bytes = term.as_bytes();
        buf.extend_from_slice(&(term_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(term_bytes);
        buf.extend_from_slice(&(posting_list.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(posting_list.len() as u32).to_le_bytes());
        for (&surrogate, &tf) in posting_list {
            buf.extend_from_slice(&surrogate.to_le_bytes());
            buf.extend_from_slice(&tf.to_le_bytes());
        }
    }

    let checksum = fnv1a(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());

    let tmp_path = path.with_extension("bm25.tmp");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RetrievalError::Internal { message: format!("create_dir_all({:?}): {e}", parent) })?;
    }
    let mut file = std::fs::File::create(&tmp_path)
        .map_err(|e| RetrievalError::Internal { message: format!("create {:?}: {e}", tmp_path) })?;
    file.write_all(&buf)
        .map_err(|e| RetrievalError::Internal { message: format!("write {:?}: {e}", tmp_path) })?;
    file.sync_all()
        .map_err(|e| RetrievalError::Internal { message: format!("sync {:?}: {e}", tmp_path) })?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| RetrievalError::Internal { message: format!("rename {:?} -> {:?}: {e}", tmp_path, path) })?;
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return None;
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Option<f32> {
        self.take(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Load a persisted index for `kb_id` from `path`.
///
/// Returns `Ok(None)` when the file is absent (a fresh knowledge base),
/// `Err(IndexCorrupt)` on a format/tokenizer-version mismatch, truncation,
/// or checksum failure — all of which the caller treats identically:
/// rebuild from the repository.
pub fn load(path: &Path, kb_id: &KbId, expected_tokenizer_version: u32) -> Result<Option<InvertedIndex>> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(RetrievalError::Internal {
                message: format!("open {:?}: {e}", path),
            })
        }
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| RetrievalError::Internal { message: format!("read {:?}: {e}", path) })?;

    if bytes.len() < 8 {
        return Err(corrupt(kb_id, "file shorter than checksum trailer"));
    }
    let (body, checksum_bytes) = bytes.split_at(bytes.len() - 8);
    let expected_checksum = u64::from_le_bytes(checksum_bytes.try_into().unwrap());
    if fnv1a(body) != expected_checksum {
        return Err(corrupt(kb_id, "checksum mismatch"));
    }

    let mut cursor = Cursor { bytes: body, pos: 0 };
    let magic = cursor.take(4).ok_or_else(|| corrupt(kb_id, "truncated magic"))?;
    if magic != MAGIC {
        return Err(corrupt(kb_id, "bad magic bytes"));
    }
    let format_version = cursor.u16().ok_or_else(|| corrupt(kb_id, "truncated format version"))?;
    if format_version != FORMAT_VERSION {
        return Err(corrupt(kb_id, format!("format version {format_version} unsupported")));
    }
    let tokenizer_version = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated tokenizer version"))?;
    if tokenizer_version != expected_tokenizer_version {
        return Err(corrupt(
            kb_id,
            format!("tokenizer version {tokenizer_version} != running {expected_tokenizer_version}"),
        ));
    }
    let _num_docs = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated num_docs"))?;
    let _avg_doc_len = cursor.f32().ok_or_else(|| corrupt(kb_id, "truncated avg_doc_len"))?;

    let doc_table_len = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated doc table length"))? as usize;
    let mut chunk_ids: Vec<(u32, ChunkId, u32)> = Vec::with_capacity(doc_table_len);
    for _ in 0..doc_table_len {
        let surrogate = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated surrogate"))?;
        let id_len = cursor.u16().ok_or_else(|| corrupt(kb_id, "truncated chunk id length"))? as usize;
        let id_bytes = cursor.take(id_len).ok_or_else(|| corrupt(kb_id, "truncated chunk id"))?;
        let id_str = std::str::from_utf8(id_bytes).map_err(|_| corrupt(kb_id, "non-utf8 chunk id"))?;
        let doc_len = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated doc length"))?;
        chunk_ids.push((surrogate, ChunkId::from(id_str), doc_len));
    }

    let term_table_len = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated term table length"))? as usize;
    let mut postings: HashMap<String, HashMap<u32, u32>> = HashMap::with_capacity(term_table_len);
    for _ in 0..term_table_len {
        let term_len = cursor.u16().ok_or_else(|| corrupt(kb_id, "truncated term length"))? as usize;
        let term_bytes = cursor.take(term_len).ok_or_else(|| corrupt(kb_id, "truncated term"))?;
        let term = std::str::from_utf8(term_bytes).map_err(|_| corrupt(kb_id, "non-utf8 term"))?.to_string();
        let _df = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated df"))?;
        let postings_len = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated postings length"))? as usize;
        let mut posting_list = HashMap::with_capacity(postings_len);
        for _ in 0..postings_len {
            let surrogate = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated posting surrogate"))?;
            let tf = cursor.u32().ok_or_else(|| corrupt(kb_id, "truncated posting tf"))?;
            posting_list.insert(surrogate, tf);
        }
        postings.insert(term, posting_list);
    }

    Ok(Some(InvertedIndex::rehydrate(chunk_ids, postings)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Bm25Params;

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn round_trips_an_index_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let kb_id = KbId::from("kb-1");
        let path = index_path(dir.path(), &kb_id);

        let mut index = InvertedIndex::new();
        index.upsert_document(ChunkId::from("a"), &terms(&["quick", "brown", "fox"]));
        index.upsert_document(ChunkId::from("b"), &terms(&["lazy", "dog"]));
        index.refresh_idf();

        save(&index, &path, 1).unwrap();
        let mut reloaded = load(&path, &kb_id, 1).unwrap().expect("index present");
        reloaded.refresh_idf();

        let results = reloaded.search(&terms(&["quick", "fox"]), 10, Bm25Params::default());
        assert!(results.iter().any(|(id, _)| id.as_str() == "a"));
    }

    #[test]
    fn tokenizer_version_mismatch_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let kb_id = KbId::from("kb-1");
        let path = index_path(dir.path(), &kb_id);
        let index = InvertedIndex::new();
        save(&index, &path, 1).unwrap();

        let result = load(&path, &kb_id, 2);
        assert!(matches!(result, Err(RetrievalError::IndexCorrupt { .. })));
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let kb_id = KbId::from("kb-1");
        let path = index_path(dir.path(), &kb_id);
        assert!(load(&path, &kb_id, 1).unwrap().is_none());
    }
}

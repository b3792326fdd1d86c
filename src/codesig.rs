//! Ad-hoc code signature blob: a SuperBlob wrapping a single CodeDirectory
//! whose slots are SHA-256 hashes of every page of the file up to the
//! signature itself. No certificate chain is involved; the kernel accepts
//! such signatures for locally-run binaries on Apple Silicon.
//!
//! Unlike the rest of the file, signature blobs are big-endian
//! (`usr/include/kern/cs_blobs.h`).

use sha2::{Digest, Sha256};

pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
pub const CSSLOT_CODEDIRECTORY: u32 = 0;
pub const CS_ADHOC: u32 = 0x2;
pub const CS_HASHTYPE_SHA256: u8 = 2;
pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x1;
/// CodeDirectory version with exec-segment support.
pub const CS_SUPPORTSEXECSEG: u32 = 0x20400;

pub const SHA256_LEN: usize = 32;
const SIZEOF_SUPER_BLOB: u64 = 12;
const SIZEOF_BLOB_INDEX: u64 = 8;
const SIZEOF_CODE_DIRECTORY: u64 = 88;

/// Exact byte size of the signature blob for a file of `code_limit` bytes
/// identified by `ident`, rounded up to 16. Used both to reserve padding in
/// `__LINKEDIT` ahead of time and to size the final write, so the two can
/// never disagree.
pub fn signature_size(ident: &str, code_limit: u64, page_size: u64) -> u64 {
    let n_pages = code_limit.div_ceil(page_size);
    let raw = SIZEOF_SUPER_BLOB
        + SIZEOF_BLOB_INDEX
        + SIZEOF_CODE_DIRECTORY
        + ident.len() as u64
        + 1
        + n_pages * SHA256_LEN as u64;
    raw.next_multiple_of(16)
}

pub struct AdHocSignature {
    ident: String,
    page_size: u64,
    code_limit: u64,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
    hashes: Vec<[u8; SHA256_LEN]>,
}

impl AdHocSignature {
    pub fn new(ident: &str, code_limit: u64, page_size: u64) -> Self {
        Self {
            ident: ident.to_owned(),
            page_size,
            code_limit,
            exec_seg_base: 0,
            exec_seg_limit: 0,
            exec_seg_flags: 0,
            hashes: Vec::new(),
        }
    }

    /// Marks the range covered by `__TEXT` as the main executable segment.
    pub fn set_exec_segment(&mut self, base: u64, limit: u64, main_binary: bool) {
        self.exec_seg_base = base;
        self.exec_seg_limit = limit;
        self.exec_seg_flags = if main_binary { CS_EXECSEG_MAIN_BINARY } else { 0 };
    }

    /// Hashes one page of file content. The final page may be short.
    pub fn add_page(&mut self, page: &[u8]) {
        debug_assert!(page.len() as u64 <= self.page_size);
        let digest = Sha256::digest(page);
        self.hashes.push(digest.into());
    }

    /// Serializes the SuperBlob. The result is exactly
    /// `signature_size(ident, code_limit, page_size)` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let total = signature_size(&self.ident, self.code_limit, self.page_size);
        let mut out = Vec::with_capacity(total as usize);

        let cd_offset = SIZEOF_SUPER_BLOB + SIZEOF_BLOB_INDEX;
        let cd_length = SIZEOF_CODE_DIRECTORY
            + self.ident.len() as u64
            + 1
            + self.hashes.len() as u64 * SHA256_LEN as u64;

        // SuperBlob { magic, length, count } + one BlobIndex
        be32(&mut out, CSMAGIC_EMBEDDED_SIGNATURE);
        be32(&mut out, (cd_offset + cd_length) as u32);
        be32(&mut out, 1);
        be32(&mut out, CSSLOT_CODEDIRECTORY);
        be32(&mut out, cd_offset as u32);

        // CodeDirectory
        let ident_offset = SIZEOF_CODE_DIRECTORY;
        let hash_offset = ident_offset + self.ident.len() as u64 + 1;
        be32(&mut out, CSMAGIC_CODEDIRECTORY);
        be32(&mut out, cd_length as u32);
        be32(&mut out, CS_SUPPORTSEXECSEG); // version
        be32(&mut out, CS_ADHOC); // flags
        be32(&mut out, hash_offset as u32);
        be32(&mut out, ident_offset as u32);
        be32(&mut out, 0); // nSpecialSlots
        be32(&mut out, self.hashes.len() as u32);
        be32(&mut out, self.code_limit as u32);
        out.push(SHA256_LEN as u8); // hashSize
        out.push(CS_HASHTYPE_SHA256);
        out.push(0); // platform
        out.push(self.page_size.trailing_zeros() as u8); // log2(pageSize)
        be32(&mut out, 0); // spare2
        be32(&mut out, 0); // scatterOffset
        be32(&mut out, 0); // teamOffset
        be32(&mut out, 0); // spare3
        be64(&mut out, 0); // codeLimit64
        be64(&mut out, self.exec_seg_base);
        be64(&mut out, self.exec_seg_limit);
        be64(&mut out, self.exec_seg_flags);

        out.extend_from_slice(self.ident.as_bytes());
        out.push(0);
        for hash in &self.hashes {
            out.extend_from_slice(hash);
        }

        out.resize(total as usize, 0);
        out
    }
}

fn be32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn be64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

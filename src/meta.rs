//! Summary: The meta page, the single commit point of the store.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Layout (little-endian):
//!
//! ```text
//! | sig | root | pages | fl head page | fl head seq | fl tail page | fl tail seq | crc32 |
//! | 16B | 8B   | 8B    | 8B           | 8B          | 8B           | 8B          | 4B    |
//! ```
//!
//! The checksum covers the first 64 bytes and rejects torn meta writes at
//! open. Everything after the checksum within page 0 is unused.

use crate::page::{DB_SIG, PAGE_SIZE};

/// Serialized size of the meta payload.
pub const META_SIZE: usize = 68;

const CRC_OFFSET: usize = 64;

/// In-memory image of the meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// Page number of the tree root; 0 for an empty tree.
    pub root: u64,
    /// Total pages allocated, meta page included.
    pub page_used: u64,
    /// Free list head/tail cut.
    pub free_head_page: u64,
    pub free_head_seq: u64,
    pub free_tail_page: u64,
    pub free_tail_seq: u64,
}

impl Meta {
    /// The meta image of a freshly created store: no tree yet, page 1
    /// reserved as the free-list placeholder node.
    pub fn new() -> Self {
        Self {
            root: 0,
            page_used: 2,
            free_head_page: 1,
            free_head_seq: 0,
            free_tail_page: 1,
            free_tail_seq: 0,
        }
    }

    /// Serializes to the meta payload, checksum included.
    pub fn to_bytes(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        buf[..16].copy_from_slice(DB_SIG);
        buf[16..24].copy_from_slice(&self.root.to_le_bytes());
        buf[24..32].copy_from_slice(&self.page_used.to_le_bytes());
        buf[32..40].copy_from_slice(&self.free_head_page.to_le_bytes());
        buf[40..48].copy_from_slice(&self.free_head_seq.to_le_bytes());
        buf[48..56].copy_from_slice(&self.free_tail_page.to_le_bytes());
        buf[56..64].copy_from_slice(&self.free_tail_seq.to_le_bytes());
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..META_SIZE].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses a meta payload. `None` on a bad signature or checksum.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < META_SIZE || &buf[..16] != DB_SIG {
            return None;
        }
        let stored_crc = u32::from_le_bytes(buf[CRC_OFFSET..META_SIZE].try_into().ok()?);
        if crc32fast::hash(&buf[..CRC_OFFSET]) != stored_crc {
            return None;
        }
        let u64_at = |pos: usize| u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        Some(Self {
            root: u64_at(16),
            page_used: u64_at(24),
            free_head_page: u64_at(32),
            free_head_seq: u64_at(40),
            free_tail_page: u64_at(48),
            free_tail_seq: u64_at(56),
        })
    }

    /// Cross-field consistency, checked against the file size in pages.
    pub fn validate(&self, file_pages: u64) -> bool {
        if self.page_used < 2 || self.page_used > file_pages.max(2) {
            return false;
        }
        if self.root >= self.page_used {
            return false;
        }
        if self.free_head_page == 0
            || self.free_head_page >= self.page_used
            || self.free_tail_page == 0
            || self.free_tail_page >= self.page_used
        {
            return false;
        }
        if self.free_head_seq > self.free_tail_seq {
            return false;
        }
        true
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}

// The payload must fit well inside page 0.
const _: () = assert!(META_SIZE <= PAGE_SIZE);

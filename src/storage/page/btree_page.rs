//! Byte layout shared by both kinds of B+-tree pages.
//!
//! Every tree page starts with the same fixed header, little-endian:
//!
//! ```text
//! offset  0: page type      (u32, 1 = internal, 2 = leaf)
//! offset  4: current size   (u32)
//! offset  8: max size       (u32)
//! offset 12: parent page id (u32)
//! offset 16: own page id    (u32)
//! ```
//!
//! Leaf pages extend the header with a forward sibling link at offset 20.

use crate::storage::page::PageData;
use std::cmp::Ordering;

pub const BTREE_INTERNAL_PAGE_TYPE: u32 = 1;
pub const BTREE_LEAF_PAGE_TYPE: u32 = 2;

pub const PAGE_TYPE_OFFSET: usize = 0;
pub const SIZE_OFFSET: usize = 4;
pub const MAX_SIZE_OFFSET: usize = 8;
pub const PARENT_PAGE_ID_OFFSET: usize = 12;
pub const PAGE_ID_OFFSET: usize = 16;
pub const COMMON_HEADER_SIZE: usize = 20;

/// Ordering of the fixed-width keys stored in tree pages.
///
/// The tree never interprets key bytes itself; all comparisons go through
/// this trait so callers can index arbitrary encodings.
pub trait KeyComparator: Clone + Send + Sync + 'static {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

pub(crate) fn read_u32(data: &PageData, offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub(crate) fn write_u32(data: &mut PageData, offset: usize, val: u32) {
    data[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

pub fn page_type(data: &PageData) -> u32 {
    read_u32(data, PAGE_TYPE_OFFSET)
}

pub fn is_leaf_page(data: &PageData) -> bool {
    page_type(data) == BTREE_LEAF_PAGE_TYPE
}

/// Header accessors valid for either page kind.
pub fn tree_page_id(data: &PageData) -> crate::storage::page::PageId {
    crate::storage::page::PageId(read_u32(data, PAGE_ID_OFFSET))
}

pub fn tree_page_parent(data: &PageData) -> crate::storage::page::PageId {
    crate::storage::page::PageId(read_u32(data, PARENT_PAGE_ID_OFFSET))
}

pub fn set_tree_page_parent(data: &mut PageData, parent: crate::storage::page::PageId) {
    write_u32(data, PARENT_PAGE_ID_OFFSET, parent.0);
}

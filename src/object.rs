//! Object layout as seen by the collector.
//!
//! Word 0 of every object holds a `*const TypeInfo`. Arrays store their
//! element count in word 1 and elements from word 2 on.
use crate::globals::WORD_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// Reference fields at the word offsets listed in `ref_offsets`.
    Plain,
    /// Every element is a reference.
    RefArray,
    /// No references at all.
    ValueArray,
}

#[derive(Debug)]
pub struct TypeInfo {
    pub id: u32,
    pub name: &'static str,
    pub kind: ObjectKind,
    /// Word offsets of reference fields, counted from the object start.
    pub ref_offsets: &'static [usize],
}

pub const ARRAY_LENGTH_OFFSET: usize = 1;
pub const ARRAY_HEADER_SIZE: usize = 2 * WORD_SIZE;

impl TypeInfo {
    pub const fn plain(id: u32, name: &'static str, ref_offsets: &'static [usize]) -> Self {
        Self {
            id,
            name,
            kind: ObjectKind::Plain,
            ref_offsets,
        }
    }

    pub const fn ref_array(id: u32, name: &'static str) -> Self {
        Self {
            id,
            name,
            kind: ObjectKind::RefArray,
            ref_offsets: &[],
        }
    }

    pub const fn value_array(id: u32, name: &'static str) -> Self {
        Self {
            id,
            name,
            kind: ObjectKind::ValueArray,
            ref_offsets: &[],
        }
    }
}

/// Bytes needed for an array of `length` elements of `stride` bytes.
pub const fn array_size(length: usize, stride: usize) -> usize {
    ARRAY_HEADER_SIZE + length * stride
}

/// # Safety
///
/// `object` must point at a live allocated object.
#[inline]
pub unsafe fn type_info<'a>(object: usize) -> Option<&'a TypeInfo> {
    (*(object as *const *const TypeInfo)).as_ref()
}

/// # Safety
///
/// `object` must point at an allocated array.
#[inline]
pub unsafe fn array_length(object: usize) -> usize {
    *(object as *const usize).add(ARRAY_LENGTH_OFFSET)
}

/// # Safety
///
/// `object` must point at an allocated array with room for `length`.
#[inline]
pub unsafe fn set_array_length(object: *mut u8, length: usize) {
    *(object as *mut usize).add(ARRAY_LENGTH_OFFSET) = length;
}

/// # Safety
///
/// `object` must point at an allocated object with at least `index + 1`
/// words.
#[inline]
pub unsafe fn read_word(object: usize, index: usize) -> usize {
    *(object as *const usize).add(index)
}

/// # Safety
///
/// `object` must point at an allocated object with at least `index + 1`
/// words.
#[inline]
pub unsafe fn write_word(object: *mut u8, index: usize, value: usize) {
    *(object as *mut usize).add(index) = value;
}

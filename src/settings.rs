//! Heap settings read from the environment.
//!
//! `COMMIX_MIN_HEAP_SIZE` and `COMMIX_MAX_HEAP_SIZE` accept a byte count with
//! an optional `k`, `m` or `g` suffix; `COMMIX_GC_THREADS` is a plain count.
use std::str::FromStr;

use crate::{globals::MAX_GC_THREADS, Config};

pub const MIN_HEAP_SIZE_VAR: &str = "COMMIX_MIN_HEAP_SIZE";
pub const MAX_HEAP_SIZE_VAR: &str = "COMMIX_MAX_HEAP_SIZE";
pub const GC_THREADS_VAR: &str = "COMMIX_GC_THREADS";

/// Byte size written as `<digits>[k|K|m|M|g|G]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapSize(pub usize);

impl FromStr for HeapSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, shift) = match s.chars().last() {
            Some('k') | Some('K') => (&s[..s.len() - 1], 10),
            Some('m') | Some('M') => (&s[..s.len() - 1], 20),
            Some('g') | Some('G') => (&s[..s.len() - 1], 30),
            Some(_) => (s, 0),
            None => return Err("empty size".into()),
        };
        let value = digits
            .parse::<usize>()
            .map_err(|e| format!("invalid size {:?}: {}", s, e))?;
        value
            .checked_mul(1 << shift)
            .map(HeapSize)
            .ok_or_else(|| format!("size {:?} overflows", s))
    }
}

pub fn parse_size(text: &str) -> Result<usize, String> {
    text.parse::<HeapSize>().map(|size| size.0)
}

pub fn parse_thread_count(text: &str) -> Result<usize, String> {
    match text.trim().parse::<usize>() {
        Ok(0) => Err("thread count must be positive".into()),
        Ok(count) => Ok(count),
        Err(e) => Err(format!("invalid thread count {:?}: {}", text, e)),
    }
}

/// One thread per core minus the mutator's, within `[1, MAX_GC_THREADS]`.
pub fn default_gc_threads() -> usize {
    clamp_gc_threads(num_cpus::get().saturating_sub(1))
}

pub fn clamp_gc_threads(count: usize) -> usize {
    count.max(1).min(MAX_GC_THREADS)
}

impl Config {
    /// Defaults overridden by the `COMMIX_*` environment variables. Values
    /// that fail to parse are reported and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let setting = |name: &str, parse: fn(&str) -> Result<usize, String>| {
            let text = lookup(name)?;
            match parse(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!("ignoring {}={:?}: {}", name, text, e);
                    None
                }
            }
        };
        if let Some(size) = setting(MIN_HEAP_SIZE_VAR, parse_size) {
            config.min_heap_size = size;
        }
        if let Some(size) = setting(MAX_HEAP_SIZE_VAR, parse_size) {
            config.max_heap_size = size;
        }
        if let Some(threads) = setting(GC_THREADS_VAR, parse_thread_count) {
            config.gc_threads = threads;
        }
        config
    }
}

//! Decoders for the two on-disk archive formats served by the bridge:
//! `.dly` daily text bars and `.scid` intraday binary records.

pub mod daily;
pub mod intraday;

/// A recoverable, single-row malformation. Counted, never fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeWarning {
    /// Zero-based row or record index in the decoded input.
    pub index:  usize,
    pub detail: String,
}

impl DecodeWarning {
    pub fn new(index: usize, detail: impl Into<String>) -> Self {
        Self {
            index,
            detail: detail.into(),
        }
    }
}

//! Data-bin byte store

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use crate::protocol::{BinClass, DataBinId};

/// Bytes of one data-bin.
///
/// The contiguous prefix from offset zero is what a decoder can use; pieces
/// that arrived out of order wait in `pieces` until the gap is filled.
#[derive(Debug, Default, Clone)]
struct DataBin {
    prefix: Vec<u8>,
    pieces: BTreeMap<u64, Vec<u8>>,
    total: Option<u64>,
}

impl DataBin {
    /// Returns the number of bytes added to the prefix.
    fn insert(&mut self, offset: u64, bytes: &[u8], is_last: bool) -> usize {
        if is_last {
            self.total = Some(offset + bytes.len() as u64);
        }
        let before = self.prefix.len();
        if offset <= self.prefix.len() as u64 {
            self.append_overlapping(offset, bytes);
            while let Some((&start, _)) = self.pieces.first_key_value() {
                if start > self.prefix.len() as u64 {
                    break;
                }
                if let Some(piece) = self.pieces.remove(&start) {
                    self.append_overlapping(start, &piece);
                }
            }
        } else {
            let slot = self.pieces.entry(offset).or_default();
            if bytes.len() > slot.len() {
                *slot = bytes.to_vec();
            }
        }
        self.prefix.len() - before
    }

    fn append_overlapping(&mut self, offset: u64, bytes: &[u8]) {
        let have = self.prefix.len() as u64;
        let skip = (have - offset) as usize;
        if skip < bytes.len() {
            self.prefix.extend_from_slice(&bytes[skip..]);
        }
    }

    fn is_complete(&self) -> bool {
        self.total.is_some_and(|t| self.prefix.len() as u64 >= t)
    }
}

/// In-memory cache of every data-bin received on a session.
#[derive(Debug, Default, Clone)]
pub struct ByteCache {
    bins: HashMap<DataBinId, DataBin>,
    bytes: usize,
}

impl ByteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a message payload. Returns the number of new contiguous bytes.
    pub fn insert(&mut self, bin: DataBinId, offset: u64, bytes: &[u8], is_last: bool) -> usize {
        let added = self.bins.entry(bin).or_default().insert(offset, bytes, is_last);
        self.bytes += added;
        added
    }

    /// Contiguous bytes of `bin` from offset zero.
    pub fn bin(&self, bin: &DataBinId) -> Option<&[u8]> {
        self.bins.get(bin).map(|b| b.prefix.as_slice())
    }

    pub fn is_complete(&self, bin: &DataBinId) -> bool {
        self.bins.get(bin).is_some_and(DataBin::is_complete)
    }

    /// Whether any bytes of `codestream` are cached.
    pub fn has_codestream(&self, codestream: u64) -> bool {
        self.bins.iter().any(|(id, bin)| id.codestream == codestream && !bin.prefix.is_empty())
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    /// Total contiguous bytes held.
    pub fn bytes_held(&self) -> usize {
        self.bytes
    }

    /// Describe the cache contents in `model=` syntax.
    ///
    /// Complete bins are listed bare, partial ones with their byte count; bins
    /// are grouped per codestream behind a `[n]` qualifier.
    pub fn model_descriptor(&self) -> String {
        let mut grouped: BTreeMap<u64, Vec<(&DataBinId, &DataBin)>> = BTreeMap::new();
        for (id, bin) in &self.bins {
            if bin.prefix.is_empty() || id.class.model_prefix().is_none() {
                continue;
            }
            grouped.entry(id.codestream).or_default().push((id, bin));
        }

        let mut out = String::new();
        for (codestream, mut bins) in grouped {
            bins.sort_by_key(|(id, _)| (id.class, id.in_class_id));
            if !out.is_empty() {
                out.push(',');
            }
            let _ = write!(out, "[{}]", codestream);
            for (id, bin) in bins {
                let prefix = id.class.model_prefix().unwrap_or_default();
                out.push(',');
                out.push_str(prefix);
                if id.class != BinClass::MainHeader {
                    let _ = write!(out, "{}", id.in_class_id);
                }
                if !bin.is_complete() {
                    let _ = write!(out, ":{}", bin.prefix.len());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn precinct(codestream: u64, id: u64) -> DataBinId {
        DataBinId::new(BinClass::Precinct, codestream, id)
    }

    #[test]
    fn out_of_order_pieces_join_the_prefix() {
        let mut cache = ByteCache::new();
        let id = precinct(0, 1);
        assert_eq!(cache.insert(id, 4, b"efgh", true), 0);
        assert_eq!(cache.bin(&id), Some(&b""[..]));
        assert!(!cache.is_complete(&id));

        assert_eq!(cache.insert(id, 0, b"abcd", false), 8);
        assert_eq!(cache.bin(&id), Some(&b"abcdefgh"[..]));
        assert!(cache.is_complete(&id));
        assert_eq!(cache.bytes_held(), 8);
    }

    #[test]
    fn overlapping_retransmission_adds_only_new_bytes() {
        let mut cache = ByteCache::new();
        let id = precinct(2, 0);
        cache.insert(id, 0, b"abc", false);
        assert_eq!(cache.insert(id, 1, b"bcde", false), 2);
        assert_eq!(cache.insert(id, 0, b"ab", false), 0);
        assert_eq!(cache.bin(&id), Some(&b"abcde"[..]));
        assert!(cache.has_codestream(2));
        assert!(!cache.has_codestream(3));
    }

    #[test]
    fn model_descriptor_lists_bins_per_codestream() {
        let mut cache = ByteCache::new();
        cache.insert(DataBinId::new(BinClass::MainHeader, 0, 0), 0, b"hdr", true);
        cache.insert(precinct(0, 7), 0, b"12", false);
        cache.insert(DataBinId::new(BinClass::TileHeader, 1, 0), 0, b"t", true);
        cache.insert(DataBinId::new(BinClass::Other(12), 1, 0), 0, b"?", true);

        assert_eq!(cache.model_descriptor(), "[0],P7:2,Hm,[1],H0");
        assert_eq!(ByteCache::new().model_descriptor(), "");
    }
}

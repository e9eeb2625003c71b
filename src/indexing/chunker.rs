//! Splitting item ids into bounded, contiguous chunks.

use serde::{Deserialize, Serialize};

/// A bounded slice of item ids of a single mapping type; the payload of one
/// chunk task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub mapping: String,
    pub ids: Vec<u64>,
}

impl Chunk {
    pub fn new(mapping: &str, ids: Vec<u64>) -> Self {
        Self {
            mapping: mapping.to_string(),
            ids,
        }
    }

    /// "response 17-1016", used as the record name so a failed slice can be
    /// found again
    pub fn label(&self) -> String {
        match (self.ids.first(), self.ids.last()) {
            (Some(first), Some(last)) => format!("{} {}-{}", self.mapping, first, last),
            _ => format!("{} (empty)", self.mapping),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Lazily split `ids` into chunks of at most `chunk_size`, in input order.
///
/// Empty input yields no chunks. `chunk_size` is validated by the config
/// layer; zero is clamped to one.
pub fn chunked<'a>(
    mapping: &'a str,
    ids: &'a [u64],
    chunk_size: usize,
) -> impl Iterator<Item = Chunk> + 'a {
    ids.chunks(chunk_size.max(1))
        .map(move |slice| Chunk::new(mapping, slice.to_vec()))
}

/// Number of chunks `chunked` produces for `n` items
pub fn chunk_count(n: usize, chunk_size: usize) -> usize {
    n.div_ceil(chunk_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_yields_nothing() {
        assert_eq!(chunked("response", &[], 10).count(), 0);
        assert_eq!(chunk_count(0, 10), 0);
    }

    #[test]
    fn test_partition_properties() {
        for n in [1usize, 2, 9, 10, 11, 99, 100, 101, 1234] {
            for size in [1usize, 3, 10, 100, 1000] {
                let ids: Vec<u64> = (100..100 + n as u64).collect();
                let chunks: Vec<Chunk> = chunked("response", &ids, size).collect();

                assert_eq!(chunks.len(), chunk_count(n, size), "n={} size={}", n, size);
                assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= size));
                assert!(chunks.iter().all(|c| c.mapping == "response"));

                let flattened: Vec<u64> = chunks.into_iter().flat_map(|c| c.ids).collect();
                assert_eq!(flattened, ids);
            }
        }
    }

    #[test]
    fn test_last_chunk_smaller() {
        let ids: Vec<u64> = (1..=25).collect();
        let sizes: Vec<usize> = chunked("response", &ids, 10).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_label() {
        let chunk = Chunk::new("response", vec![17, 18, 40]);
        assert_eq!(chunk.label(), "response 17-40");
        assert_eq!(Chunk::new("response", vec![]).label(), "response (empty)");
    }

    #[test]
    fn test_chunk_payload_serializes() {
        let chunk = Chunk::new("response", vec![1, 2, 3]);
        let json = serde_json::to_string(&chunk).unwrap();
        assert_eq!(json, r#"{"mapping":"response","ids":[1,2,3]}"#);
        let back: Chunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
    }
}

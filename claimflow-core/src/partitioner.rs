//! Maps a claim key onto one of a fixed set of partitions. The mapping only depends on the key
//! and the number of partitions, so it is stable across calls and across restarts.

use xxhash_rust::xxh32::xxh32;

use crate::error::{Error, Result};

const HASH_SEED: u32 = 0;
const NON_NEGATIVE_MAX: u32 = i32::MAX as u32;

pub(crate) struct KeyPartitioner<T> {
    partitions: Vec<T>,
    /// Width of the hash range owned by each partition.
    bucket_size: u32,
    /// Hashes are folded below this bound, a multiple of the partition count, so every partition
    /// owns a range of exactly `bucket_size` values.
    hash_limit: u32,
}

impl<T> KeyPartitioner<T> {
    pub(crate) fn new(partitions: Vec<T>) -> Result<Self> {
        if partitions.is_empty() {
            return Err(Error::Config(
                "key partitioner needs at least one partition".to_string(),
            ));
        }
        let count = u32::try_from(partitions.len())
            .ok()
            .filter(|count| *count <= NON_NEGATIVE_MAX)
            .ok_or_else(|| Error::Config(format!("too many partitions: {}", partitions.len())))?;

        let bucket_size = NON_NEGATIVE_MAX / count;
        Ok(Self {
            partitions,
            bucket_size,
            hash_limit: bucket_size * count,
        })
    }

    /// Index of the partition owning `key`.
    pub(crate) fn partition_index(&self, key: &str) -> usize {
        let hash = xxh32(key.as_bytes(), HASH_SEED) & NON_NEGATIVE_MAX;
        ((hash % self.hash_limit) / self.bucket_size) as usize
    }

    #[allow(clippy::indexing_slicing)] // partition_index is always below the partition count
    pub(crate) fn partition_for(&self, key: &str) -> &T {
        &self.partitions[self.partition_index(key)]
    }

    pub(crate) fn partitions(&self) -> &[T] {
        &self.partitions
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_partitions() {
        assert!(KeyPartitioner::<usize>::new(vec![]).is_err());
    }

    #[test]
    fn test_single_partition() {
        let partitioner = KeyPartitioner::new(vec!["only"]).unwrap();
        for key in ["", "a", "claim-1", "some-much-longer-claim-key"] {
            assert_eq!(*partitioner.partition_for(key), "only");
        }
    }

    #[test]
    fn test_deterministic() {
        let partitioner = KeyPartitioner::new((0..7).collect::<Vec<usize>>()).unwrap();
        let other = KeyPartitioner::new((0..7).collect::<Vec<usize>>()).unwrap();
        for i in 0..1_000 {
            let key = format!("claim-{i}");
            let first = *partitioner.partition_for(&key);
            assert_eq!(first, *partitioner.partition_for(&key));
            assert_eq!(first, *other.partition_for(&key));
            assert!(first < 7);
        }
    }

    #[test]
    fn test_distribution() {
        let partitions = 5;
        let keys = 50_000;
        let partitioner = KeyPartitioner::new((0..partitions).collect::<Vec<usize>>()).unwrap();

        let mut counts = vec![0usize; partitions];
        for i in 0..keys {
            counts[partitioner.partition_index(&format!("{i:08}-claim"))] += 1;
        }

        let expected = keys / partitions;
        for count in counts {
            let deviation = count.abs_diff(expected) as f64 / expected as f64;
            assert!(deviation < 0.05, "partition skewed: {count} vs {expected}");
        }
    }
}

//! Property-Based Tests for Store Decorators
//!
//! # Test Properties
//!
//! 1. **Roundtrip**: decode(encode(data)) = data for any threshold
//! 2. **Raw passthrough**: values without an envelope decode unchanged
//! 3. **Determinism**: identical partitioners agree on every key
//! 4. **Bounded remap**: adding an instance only moves keys onto it

#![cfg(test)]

use proptest::prelude::*;

use super::compression::{CompressionCodec, CompressionConfig};
use super::partition::{PartitionStrategy, Partitioner};

// =============================================================================
// Property Strategies
// =============================================================================

/// Payloads from empty to a few KB, biased toward compressible runs
fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..4096),
        (any::<u8>(), 0usize..8192).prop_map(|(b, n)| vec![b; n]),
    ]
}

fn keys_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z0-9:_-]{1,24}", 1..200)
}

fn keyed_strategy() -> impl Strategy<Value = PartitionStrategy> {
    prop_oneof![
        Just(PartitionStrategy::Hash),
        Just(PartitionStrategy::ConsistentHash),
        Just(PartitionStrategy::Range),
    ]
}

// =============================================================================
// Compression Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_codec_roundtrip(data in payload_strategy(), threshold in 0usize..2048) {
        let codec = CompressionCodec::new(CompressionConfig {
            enabled: true,
            threshold_bytes: threshold,
            ..Default::default()
        });

        let stored = codec.encode(&data)?;
        let restored = codec.decode(&stored)?;
        prop_assert_eq!(restored.as_ref(), data.as_slice());

        let stats = codec.stats();
        prop_assert_eq!(stats.compressed_entries + stats.uncompressed_entries, 1);
        if data.len() < threshold {
            prop_assert_eq!(stats.compressed_entries, 0);
        }
    }

    #[test]
    fn prop_raw_values_pass_through(mut data in prop::collection::vec(any::<u8>(), 0..512)) {
        if data.first() == Some(&0xB7) {
            data[0] = 0;
        }
        let codec = CompressionCodec::default();
        let restored = codec.decode(&data)?;
        prop_assert_eq!(restored.as_ref(), data.as_slice());
    }
}

// =============================================================================
// Partitioning Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_partitioning_is_deterministic(
        strategy in keyed_strategy(),
        instances in 1usize..12,
        keys in keys_strategy(),
    ) {
        let a = Partitioner::with_count(strategy, instances, 64)?;
        let b = Partitioner::with_count(strategy, instances, 64)?;

        for key in &keys {
            let owner = a.partition_for(key);
            prop_assert!(owner < instances);
            prop_assert_eq!(owner, b.partition_for(key));
            prop_assert_eq!(owner, a.partition_for(key));
        }
    }

    #[test]
    fn prop_consistent_hash_moves_keys_only_to_new_instance(
        instances in 1usize..10,
        keys in keys_strategy(),
    ) {
        let before = Partitioner::with_count(PartitionStrategy::ConsistentHash, instances, 100)?;
        let after = before.with_instance_added("joining")?;

        for migration in before.plan_migration(&keys, &after) {
            prop_assert_eq!(migration.to.as_str(), "joining");
        }
    }

    #[test]
    fn prop_consistent_hash_removal_moves_only_orphaned_keys(
        instances in 2usize..10,
        keys in keys_strategy(),
        victim in any::<prop::sample::Index>(),
    ) {
        let before = Partitioner::with_count(PartitionStrategy::ConsistentHash, instances, 100)?;
        let leaving = before.instances()[victim.index(instances)].clone();
        let after = before.with_instance_removed(&leaving)?;

        for migration in before.plan_migration(&keys, &after) {
            prop_assert_eq!(&migration.from, &leaving);
        }
    }
}

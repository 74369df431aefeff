//! Key-based partition selection.

use crate::event::SourceKey;

/// `crc32(canonical key) mod partition_count`.
///
/// CRC-32 is fixed by its polynomial, so the mapping is stable across
/// processes and releases.
pub fn partition_for(key: &SourceKey, partition_count: i32) -> i32 {
    let count = partition_count.max(1) as u32;
    (crc32fast::hash(key.canonical().as_bytes()) % count) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnValue, KeyColumn};

    #[test]
    fn test_same_key_same_partition() {
        let a = SourceKey::single("public.orders", "id", ColumnValue::Int(42));
        let b = SourceKey::single("public.orders", "id", ColumnValue::Int(42));
        for count in [1, 3, 12, 64] {
            assert_eq!(partition_for(&a, count), partition_for(&b, count));
            assert!((0..count).contains(&partition_for(&a, count)));
        }
    }

    #[test]
    fn test_stable_value() {
        let key = SourceKey::single("public.orders", "id", ColumnValue::Int(42));
        let expected = crc32fast::hash(b"public.orders/id=42") % 8;
        assert_eq!(partition_for(&key, 8), expected as i32);
    }

    #[test]
    fn test_composite_keys_spread() {
        let partitions: std::collections::HashSet<i32> = (0..200)
            .map(|i| {
                SourceKey::new(
                    "public.line_items",
                    vec![
                        KeyColumn {
                            name: "order_id".into(),
                            value: ColumnValue::Int(i),
                        },
                        KeyColumn {
                            name: "line".into(),
                            value: ColumnValue::Int(1),
                        },
                    ],
                )
            })
            .map(|key| partition_for(&key, 8))
            .collect();
        assert!(partitions.len() > 1);
    }

    #[test]
    fn test_zero_partitions_treated_as_one() {
        let key = SourceKey::single("public.t", "id", ColumnValue::Int(1));
        assert_eq!(partition_for(&key, 0), 0);
    }
}

//! Property tests for the composite-key codec's two core guarantees
//! (spec.md §8): order preservation and round-tripping.

use polykv::key::codec;
use polykv::key::{FieldSpec, FieldValue, KeySpec};
use proptest::prelude::*;

fn tuple_cmp(a: &[FieldValue], b: &[FieldValue]) -> std::cmp::Ordering {
    a.cmp(&b.to_vec())
}

proptest! {
    #[test]
    fn round_trip_int_spec(n in any::<i64>()) {
        let spec = KeySpec::new(vec![FieldSpec::Int]);
        let key = vec![FieldValue::Int(n)];
        let encoded = codec::encode(&key, &spec).unwrap();
        let decoded = codec::decode(&encoded, &spec).unwrap();
        prop_assert_eq!(key, decoded);
    }

    #[test]
    fn round_trip_str_spec(s in "[a-z\x00]{0,20}") {
        let spec = KeySpec::new(vec![FieldSpec::Str]);
        let key = vec![FieldValue::Str(s)];
        let encoded = codec::encode(&key, &spec).unwrap();
        let decoded = codec::decode(&encoded, &spec).unwrap();
        prop_assert_eq!(key, decoded);
    }

    #[test]
    fn order_preservation_int_pair(a in any::<i64>(), b in any::<i64>()) {
        let spec = KeySpec::new(vec![FieldSpec::Int]);
        let ka = vec![FieldValue::Int(a)];
        let kb = vec![FieldValue::Int(b)];
        let ea = codec::encode(&ka, &spec).unwrap();
        let eb = codec::encode(&kb, &spec).unwrap();
        prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
    }

    #[test]
    fn order_preservation_composite(
        a_s in "[a-c]{1,4}", a_n in any::<i64>(),
        b_s in "[a-c]{1,4}", b_n in any::<i64>(),
    ) {
        let spec = KeySpec::new(vec![FieldSpec::Str, FieldSpec::Int]);
        let ka = vec![FieldValue::Str(a_s), FieldValue::Int(a_n)];
        let kb = vec![FieldValue::Str(b_s), FieldValue::Int(b_n)];
        let ea = codec::encode(&ka, &spec).unwrap();
        let eb = codec::encode(&kb, &spec).unwrap();
        prop_assert_eq!(tuple_cmp(&ka, &kb), ea.cmp(&eb));
    }
}

#[test]
fn round_trip_mixed_spec_smoke() {
    let spec = KeySpec::new(vec![FieldSpec::Id, FieldSpec::Int, FieldSpec::Str]);
    let key = vec![
        FieldValue::Id([9u8; 16]),
        FieldValue::Int(i64::MIN),
        FieldValue::Str("x\0y".to_string()),
    ];
    let encoded = codec::encode(&key, &spec).unwrap();
    let decoded = codec::decode(&encoded, &spec).unwrap();
    assert_eq!(key, decoded);
}

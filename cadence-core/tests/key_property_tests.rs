//! Property-Based Tests for Request Identity
//!
//! **Property 7: Structural Identity**
//!
//! Two keys built from equal JSON values are equal regardless of object
//! field order, and a key survives conversion to JSON and back unchanged.

use cadence_core::QueryKey;
use proptest::prelude::*;
use serde_json::{Map, Value};

fn arb_key_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|fields| Value::Object(fields.into_iter().collect())),
        ]
    })
}

/// Rebuild every object with its fields inserted in reverse order.
fn reversed(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(reversed).collect()),
        Value::Object(fields) => {
            let mut out = Map::new();
            for (k, v) in fields.iter().rev() {
                out.insert(k.clone(), reversed(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_key_roundtrips_through_json(entity in "[a-z][a-zA-Z]{0,12}", args in arb_key_value()) {
        let key = QueryKey::new(entity).unwrap().arg_json(args).unwrap();
        let back = QueryKey::from_json(key.to_json()).unwrap();
        prop_assert_eq!(&back, &key);
        prop_assert_eq!(back.to_string(), key.to_string());
    }

    #[test]
    fn prop_field_order_does_not_change_identity(args in arb_key_value()) {
        let a = QueryKey::new("catalog").unwrap().arg_json(args.clone()).unwrap();
        let b = QueryKey::new("catalog").unwrap().arg_json(reversed(&args)).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert!(b.starts_with(&QueryKey::new("catalog").unwrap()));
    }

    #[test]
    fn prop_floats_never_form_keys(x in any::<f64>().prop_filter("fractional", |x| x.is_finite() && x.fract() != 0.0)) {
        let result = QueryKey::new("track").unwrap().arg_json(serde_json::json!({"score": x}));
        prop_assert!(result.is_err());
    }
}

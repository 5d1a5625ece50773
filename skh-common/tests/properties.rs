//! Property tests for result classification and YAML comparison.

use std::collections::BTreeMap;
use std::time::Duration;

use proptest::prelude::*;
use serde_yaml_ng::{Mapping, Value};
use skh_common::e2e::{AttemptOutcome, InvocationResult, YamlValidator};

fn result_with(exit_code: i32) -> InvocationResult {
    InvocationResult {
        exit_code,
        stdout: String::new(),
        stderr: String::new(),
        command: vec!["skill-hub".to_string(), "status".to_string()],
        duration: Duration::from_millis(1),
    }
}

fn mapping(entries: &BTreeMap<String, i64>) -> Value {
    let mut map = Mapping::new();
    for (key, value) in entries {
        map.insert(Value::from(key.as_str()), Value::from(*value));
    }
    Value::Mapping(map)
}

fn entries() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map("[a-e]{1,2}", -3i64..3, 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_success_iff_exit_zero(code in any::<i32>()) {
        let result = result_with(code);
        prop_assert_eq!(result.success(), code == 0);
        prop_assert_eq!(result.assert_success().is_ok(), code == 0);
        prop_assert_eq!(result.assert_failure().is_ok(), code != 0);
        let outcome = AttemptOutcome::classify(Ok(result));
        prop_assert_eq!(outcome.is_success(), code == 0);
    }

    #[test]
    fn test_compare_is_reflexive(a in entries()) {
        let doc = mapping(&a);
        prop_assert!(YamlValidator::default().compare(&doc, &doc, &[]).is_empty());
    }

    #[test]
    fn test_compare_is_symmetric_in_equality(a in entries(), b in entries()) {
        let v = YamlValidator::default();
        let (x, y) = (mapping(&a), mapping(&b));
        let forward = v.compare(&x, &y, &[]);
        let backward = v.compare(&y, &x, &[]);
        prop_assert_eq!(forward.len(), backward.len());
        prop_assert_eq!(forward.is_empty(), a == b);
    }

    #[test]
    fn test_ignored_keys_never_reported(a in entries(), b in entries()) {
        let v = YamlValidator::default();
        let differences = v.compare(&mapping(&a), &mapping(&b), &["a", "b"]);
        for line in &differences {
            prop_assert!(!line.starts_with("a:") && !line.starts_with("b:"), "{}", line);
        }
    }
}

use fragdb::vector::{decode, encode, parse_json_floats};
use proptest::prelude::*;

fn bits(values: &[f64]) -> Vec<u64> {
    values.iter().map(|v| v.to_bits()).collect()
}

/// Both parsers must agree on acceptance, and on every value when accepting.
fn assert_agrees(input: &str) -> Result<(), TestCaseError> {
    let reference = serde_json::from_str::<Vec<f64>>(input);
    let ours = parse_json_floats(input);

    match (reference, ours) {
        (Ok(expected), Ok(actual)) => prop_assert_eq!(bits(&expected), bits(&actual), "input {:?}", input),
        (Err(_), Err(_)) => {}
        (expected, actual) => prop_assert!(
            false,
            "disagreement on {:?}: serde_json {:?}, parser {:?}",
            input,
            expected.map_err(|e| e.to_string()),
            actual
        ),
    }
    Ok(())
}

fn json_number() -> impl Strategy<Value = String> {
    "-?(0|[1-9][0-9]{0,6})(\\.[0-9]{1,5})?([eE][+-]?[0-9]{1,3})?"
}

fn finite_f64() -> impl Strategy<Value = f64> {
    use prop::num::f64::{NEGATIVE, NORMAL, POSITIVE, SUBNORMAL, ZERO};
    POSITIVE | NEGATIVE | NORMAL | SUBNORMAL | ZERO
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    #[test]
    fn parser_agrees_on_noise(input in "[\\[\\]0-9eE.+\\-, \t\n]{0,24}") {
        assert_agrees(&input)?;
    }

    #[test]
    fn parser_agrees_on_bracketed_noise(body in "[0-9eE.+\\-, ]{0,20}") {
        assert_agrees(&format!("[{}]", body))?;
    }

    #[test]
    fn parser_agrees_on_well_formed_arrays(
        numbers in prop::collection::vec(json_number(), 0..8),
        pad in "[ \t\n]{0,2}",
    ) {
        let input = format!("{pad}[{pad}{}{pad}]{pad}", numbers.join(format!("{pad},{pad}").as_str()));
        assert_agrees(&input)?;
    }

    #[test]
    fn parser_reads_serialized_floats(values in prop::collection::vec(finite_f64(), 0..16)) {
        let text = serde_json::to_string(&values).unwrap();
        let parsed = parse_json_floats(&text).unwrap();
        prop_assert_eq!(bits(&parsed), bits(&values));
    }

    #[test]
    fn blob_round_trips_every_bit_pattern(raw in prop::collection::vec(any::<u64>(), 0..32)) {
        let values: Vec<f64> = raw.iter().map(|&b| f64::from_bits(b)).collect();
        let blob = encode(&values);

        prop_assert_eq!(blob.len(), 8 * values.len());
        prop_assert_eq!(bits(&decode(&blob).unwrap()), raw);
    }

    #[test]
    fn decode_rejects_ragged_blobs(blob in prop::collection::vec(any::<u8>(), 0..64)) {
        prop_assert_eq!(decode(&blob).is_ok(), blob.len() % 8 == 0);
    }
}

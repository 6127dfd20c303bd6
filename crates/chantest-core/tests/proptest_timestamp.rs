use chantest_core::clock::{format_utc_time, parse_utc_time};
use chrono::{DateTime, Utc};
use proptest::prelude::*;

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(2000))]

    #[test]
    fn canonical_strings_survive_parse_and_format(secs in 0i64..4_102_444_800) {
        let time = DateTime::<Utc>::from_timestamp(secs, 0).expect("in range");
        let text = format_utc_time(time);
        prop_assert_eq!(text.len(), 25);
        prop_assert!(text.ends_with("+00:00"));

        let parsed = parse_utc_time(&text).expect("canonical text parses");
        prop_assert_eq!(parsed, time);
        prop_assert_eq!(format_utc_time(parsed), text);
    }

    #[test]
    fn sub_second_precision_is_dropped(secs in 0i64..4_102_444_800, nanos in 1u32..1_000_000_000) {
        let time = DateTime::<Utc>::from_timestamp(secs, nanos).expect("in range");
        let parsed = parse_utc_time(&format_utc_time(time)).expect("parses");
        prop_assert_eq!(parsed.timestamp(), secs);
        prop_assert_eq!(parsed.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn other_offsets_are_rejected(secs in 0i64..4_102_444_800, hours in 1u32..12) {
        let time = DateTime::<Utc>::from_timestamp(secs, 0).expect("in range");
        let text = format_utc_time(time).replace("+00:00", &format!("+{hours:02}:00"));
        prop_assert!(parse_utc_time(&text).is_err());
    }
}

use std::collections::BTreeMap;

use chantest_core::downloads::DownloadSnapshot;
use chantest_core::selector::{Freshness, freshness, select};
use chantest_core::status::{PackageState, StatusDocument};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0)
        .single()
        .expect("valid time")
}

fn arb_state() -> impl Strategy<Value = PackageState> {
    prop_oneof![
        Just(PackageState::Running),
        Just(PackageState::Passed),
        Just(PackageState::Failed),
        Just(PackageState::TimedOut),
        Just(PackageState::SolveFailed),
        Just(PackageState::SolveTimedOut),
    ]
}

/// A status history: state plus how many hours before `now()` it started.
fn arb_history() -> impl Strategy<Value = Option<(PackageState, i64)>> {
    proptest::option::of((arb_state(), 0i64..24 * 90))
}

fn arb_channel() -> impl Strategy<Value = Vec<(u64, Option<(PackageState, i64)>)>> {
    proptest::collection::vec((0u64..1_000, arb_history()), 0..40)
}

fn build(
    channel: &[(u64, Option<(PackageState, i64)>)],
) -> (DownloadSnapshot, BTreeMap<String, StatusDocument>) {
    let mut snapshot = DownloadSnapshot::new();
    let mut statuses = BTreeMap::new();
    for (i, (downloads, history)) in channel.iter().enumerate() {
        let name = format!("pkg{i:03}");
        snapshot.insert(name.clone(), *downloads);
        if let Some((state, hours_ago)) = history {
            let mut doc = StatusDocument::running(&name, "linux-64", now() - Duration::hours(*hours_ago));
            doc.state = *state;
            statuses.insert(name, doc);
        }
    }
    (snapshot, statuses)
}

fn sort_key(
    package: &str,
    snapshot: &DownloadSnapshot,
    statuses: &BTreeMap<String, StatusDocument>,
) -> (DateTime<Utc>, std::cmp::Reverse<u64>) {
    let Freshness::Processed(at) = freshness(statuses.get(package), now()) else {
        panic!("{package} is in progress but was selected");
    };
    (at, std::cmp::Reverse(snapshot[package]))
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(512))]

    #[test]
    fn selection_is_ordered_and_bounded(channel in arb_channel(), limit in -2i64..50) {
        let (snapshot, statuses) = build(&channel);
        let picked = select(now(), limit, &snapshot, &statuses);

        if limit > 0 {
            prop_assert!(picked.len() <= usize::try_from(limit).unwrap_or(usize::MAX));
        }
        for package in &picked {
            prop_assert!(snapshot.contains_key(package));
        }
        let keys: Vec<_> = picked.iter().map(|p| sort_key(p, &snapshot, &statuses)).collect();
        for pair in keys.windows(2) {
            prop_assert!(pair[0] <= pair[1], "out of order: {:?}", pair);
        }
        let unique: std::collections::BTreeSet<&String> = picked.iter().collect();
        prop_assert_eq!(unique.len(), picked.len());
    }

    #[test]
    fn unlimited_selection_is_every_eligible_package(channel in arb_channel()) {
        let (snapshot, statuses) = build(&channel);
        let mut picked = select(now(), 0, &snapshot, &statuses);
        picked.sort();

        let eligible: Vec<String> = snapshot
            .keys()
            .filter(|p| freshness(statuses.get(*p), now()) != Freshness::InProgress)
            .cloned()
            .collect();
        prop_assert_eq!(picked, eligible);
    }

    #[test]
    fn recent_running_packages_are_never_picked(channel in arb_channel(), limit in 0i64..10) {
        let (snapshot, statuses) = build(&channel);
        for package in select(now(), limit, &snapshot, &statuses) {
            if let Some(doc) = statuses.get(&package) {
                prop_assert!(
                    doc.state != PackageState::Running || now() - doc.started_at > Duration::hours(24)
                );
            }
        }
    }
}

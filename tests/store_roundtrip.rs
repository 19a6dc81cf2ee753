//! File-level behavior of the failure store: persistence, rewrite order,
//! eviction, and damage tolerance.

use std::collections::BTreeMap;
use std::fs;

use chrono::{NaiveDate, NaiveDateTime};

use regress_rs::{FailureRecord, FailureStore, STORE_EXTENSION};

fn names() -> Vec<String> {
    vec!["placemark".to_string()]
}

fn ts(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 8, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn record(seed: u64, position: u64, day: u32) -> FailureRecord {
    let mut marks = BTreeMap::new();
    marks.insert("placemark".to_string(), position);
    FailureRecord::new(seed, position, marks, ts(day, 12))
}

#[test]
fn missing_file_is_an_empty_store() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let path = tmp.path().join(format!("soak.{STORE_EXTENSION}"));
    let store = FailureStore::open(path.clone(), &names(), 5).expect("open store");
    assert!(store.is_empty());
    assert!(!path.exists(), "opening must not create the file");
}

#[test]
fn records_survive_reopen() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let path = tmp.path().join(format!("soak.{STORE_EXTENSION}"));

    let mut store = FailureStore::open(path.clone(), &names(), 5).expect("open store");
    store.record_failure(record(0xaaa, 40, 20)).expect("record");
    store.record_failure(record(0xbbb, 10, 21)).expect("record");
    drop(store);

    let reopened = FailureStore::open(path, &names(), 5).expect("reopen store");
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.skipped_rows(), 0);
    let seeds: Vec<u64> = reopened.records().iter().map(|r| r.seed).collect();
    assert!(seeds.contains(&0xaaa) && seeds.contains(&0xbbb));
    for rec in reopened.records() {
        assert!(!rec.is_resolved());
        assert_eq!(rec.placemarks.get("placemark"), Some(&rec.position));
    }
}

#[test]
fn file_is_rewritten_unresolved_first() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let path = tmp.path().join(format!("soak.{STORE_EXTENSION}"));

    let fixed = record(0xaaa, 10, 20);
    let open_failure = record(0xbbb, 99, 21);
    let mut store = FailureStore::open(path.clone(), &names(), 5).expect("open store");
    store.record_failure(fixed.clone()).expect("record");
    store.record_failure(open_failure).expect("record");
    store.mark_fixed(&fixed, ts(22, 9)).expect("mark fixed");

    let text = fs::read_to_string(&path).expect("read store file");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3, "header plus two rows: {text}");
    assert_eq!(lines[0], "Failed,Fixed,Seed,Position,placemark");
    assert!(
        lines[1].contains(",bbb,"),
        "unresolved row must come first: {text}"
    );
    assert!(
        lines[2].contains("22Aug2026 09:00:00,aaa,"),
        "resolved row with its fix time must come last: {text}"
    );
}

#[test]
fn fixes_are_evicted_oldest_first() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let path = tmp.path().join(format!("soak.{STORE_EXTENSION}"));

    let first = record(1, 10, 18);
    let second = record(2, 20, 18);
    let third = record(3, 30, 18);
    let mut store = FailureStore::open(path.clone(), &names(), 2).expect("open store");
    for rec in [&first, &second, &third] {
        store.record_failure(rec.clone()).expect("record");
    }
    store.mark_fixed(&first, ts(20, 8)).expect("fix first");
    store.mark_fixed(&second, ts(21, 8)).expect("fix second");
    store.mark_fixed(&third, ts(22, 8)).expect("fix third");

    let reopened = FailureStore::open(path, &names(), 2).expect("reopen store");
    let seeds: Vec<u64> = reopened.records().iter().map(|r| r.seed).collect();
    assert_eq!(seeds.len(), 2, "oldest fix must be evicted");
    assert!(!seeds.contains(&1), "seed 1 had the oldest fix: {seeds:?}");
    assert!(seeds.contains(&2) && seeds.contains(&3));
}

#[test]
fn malformed_rows_are_skipped_not_fatal() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let path = tmp.path().join(format!("soak.{STORE_EXTENSION}"));
    fs::write(
        &path,
        "Failed,Fixed,Seed,Position,placemark\n\
         25Aug2026 12:00:00,,aaa,40,40\n\
         this row is damaged\n\
         25Aug2026 13:00:00,,zz_not_hex,10,\n",
    )
    .expect("write store file");

    let store = FailureStore::open(path, &names(), 5).expect("open store");
    assert_eq!(store.len(), 1);
    assert_eq!(store.skipped_rows(), 2);
    assert_eq!(store.records()[0].seed, 0xaaa);
}

#[test]
fn header_columns_override_configured_names() {
    // Records written under an older placemark name stay attached to that
    // name when the config has moved on.
    let tmp = tempfile::tempdir().expect("create temp dir");
    let path = tmp.path().join(format!("soak.{STORE_EXTENSION}"));
    fs::write(
        &path,
        "Failed,Fixed,Seed,Position,legacy_mark\n25Aug2026 12:00:00,,1f,8,8\n",
    )
    .expect("write store file");

    let store = FailureStore::open(path, &names(), 5).expect("open store");
    assert_eq!(store.len(), 1);
    assert_eq!(store.records()[0].placemarks.get("legacy_mark"), Some(&8));
    assert!(store.records()[0].placemarks.get("placemark").is_none());
}

#[test]
fn recording_a_resolved_case_clears_its_fix() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let path = tmp.path().join(format!("soak.{STORE_EXTENSION}"));

    let rec = record(0xcafe, 17, 20);
    let mut store = FailureStore::open(path.clone(), &names(), 5).expect("open store");
    store.record_failure(rec.clone()).expect("record");
    store.mark_fixed(&rec, ts(21, 8)).expect("mark fixed");
    store.record_failure(rec.clone()).expect("regress");

    let reopened = FailureStore::open(path, &names(), 5).expect("reopen store");
    assert_eq!(reopened.len(), 1);
    assert!(
        !reopened.records()[0].is_resolved(),
        "a regressed record must read back unresolved"
    );
}

#[test]
fn locate_uses_the_explicit_directory() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let path = FailureStore::locate(Some(tmp.path()), "soak", "queue.soak");
    assert_eq!(path, tmp.path().join("soak.broken"));
}

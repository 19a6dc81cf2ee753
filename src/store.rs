//! Known-failure persistence.
//!
//! # File format
//!
//! One CSV file per testable, human-editable on purpose (delete a row to
//! forget a failure):
//!
//! ```text
//! Failed,Fixed,Seed,Position,connect,transfer
//! 25Aug2026 14:03:05,,1a2bc3d4e5f60718,442,17,431
//! 24Aug2026 09:10:11,25Aug2026 10:00:00,77aa,90,12,
//! ```
//!
//! - Header: `Failed,Fixed,Seed,Position` plus one column per recognized
//!   placemark name, in configured order.
//! - Timestamps: `ddMMMyyyy HH:mm:ss`, blank `Fixed` means unresolved.
//! - Seed is lowercase hex without a prefix; positions are decimal; a blank
//!   placemark column means that placemark was never reached.
//!
//! # Invariants
//!
//! - Rows are written unresolved-first (ascending failure time), then
//!   resolved (ascending fix time), so the replay order is the file order.
//! - The whole file is rewritten after every mutation. Single writer;
//!   a crash between truncate and write can lose the file. Accepted.
//! - Loading tolerates damage: malformed rows are skipped with a warning
//!   and counted, never fatal. When the file carries a header, its columns
//!   drive parsing, so records survive placemark renames in config.
//! - At most `max_remembered_fixes` resolved records are kept; the oldest
//!   fixes are evicted first.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, Timelike};

use crate::error::HarnessError;

pub(crate) const STORE_TIME_FORMAT: &str = "%d%b%Y %H:%M:%S";
const HEADER_PREFIX: &str = "Failed,Fixed,Seed,Position";

/// File extension for failure stores.
pub const STORE_EXTENSION: &str = "broken";

/// Current local time truncated to whole seconds, matching the file
/// format's resolution so round-trips compare equal.
pub(crate) fn now_store_time() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

// ============================================================================
// Record
// ============================================================================

/// One known failure: where it happened and its resolution history.
///
/// Identity is `(seed, position, placemarks)`; the timestamps are history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub seed: u64,
    pub position: u64,
    pub placemarks: BTreeMap<String, u64>,
    pub failed_at: NaiveDateTime,
    /// Present once a later run saw this case pass. Resolved records are
    /// still replayed so regressions surface promptly.
    pub fixed_at: Option<NaiveDateTime>,
}

impl FailureRecord {
    pub fn new(
        seed: u64,
        position: u64,
        placemarks: BTreeMap<String, u64>,
        failed_at: NaiveDateTime,
    ) -> Self {
        Self {
            seed,
            position,
            placemarks,
            failed_at,
            fixed_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.fixed_at.is_some()
    }

    /// Same case by identity, regardless of history.
    pub fn same_case(&self, other: &FailureRecord) -> bool {
        self.seed == other.seed
            && self.position == other.position
            && self.placemarks == other.placemarks
    }
}

impl Ord for FailureRecord {
    /// Ascending byte position, then seed; history fields break remaining
    /// ties so the order is total.
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.seed.cmp(&other.seed))
            .then_with(|| self.placemarks.cmp(&other.placemarks))
            .then_with(|| self.failed_at.cmp(&other.failed_at))
            .then_with(|| self.fixed_at.cmp(&other.fixed_at))
    }
}

impl PartialOrd for FailureRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Row codec
// ============================================================================

fn format_row(record: &FailureRecord, names: &[String]) -> String {
    let mut row = record.failed_at.format(STORE_TIME_FORMAT).to_string();
    row.push(',');
    if let Some(fixed) = record.fixed_at {
        row.push_str(&fixed.format(STORE_TIME_FORMAT).to_string());
    }
    row.push(',');
    row.push_str(&format!("{:x}", record.seed));
    row.push(',');
    row.push_str(&record.position.to_string());
    for name in names {
        row.push(',');
        if let Some(position) = record.placemarks.get(name) {
            row.push_str(&position.to_string());
        }
    }
    row
}

fn parse_row(line: &str, names: &[String]) -> Result<FailureRecord, String> {
    let mut fields = line.split(',');
    let failed = fields.next().ok_or("missing Failed field")?.trim();
    let fixed = fields.next().ok_or("missing Fixed field")?.trim();
    let seed = fields.next().ok_or("missing Seed field")?.trim();
    let position = fields.next().ok_or("missing Position field")?.trim();

    let failed_at = NaiveDateTime::parse_from_str(failed, STORE_TIME_FORMAT)
        .map_err(|e| format!("bad Failed timestamp {failed:?}: {e}"))?;
    let fixed_at = if fixed.is_empty() {
        None
    } else {
        Some(
            NaiveDateTime::parse_from_str(fixed, STORE_TIME_FORMAT)
                .map_err(|e| format!("bad Fixed timestamp {fixed:?}: {e}"))?,
        )
    };
    let seed = u64::from_str_radix(seed, 16).map_err(|e| format!("bad seed {seed:?}: {e}"))?;
    let position: u64 = position
        .parse()
        .map_err(|e| format!("bad position {position:?}: {e}"))?;

    let mut placemarks = BTreeMap::new();
    for name in names {
        let field = fields.next().unwrap_or("").trim();
        if !field.is_empty() {
            let mark: u64 = field
                .parse()
                .map_err(|e| format!("bad {name} position {field:?}: {e}"))?;
            placemarks.insert(name.clone(), mark);
        }
    }

    Ok(FailureRecord {
        seed,
        position,
        placemarks,
        failed_at,
        fixed_at,
    })
}

/// File write order: unresolved first by failure time, then resolved by fix
/// time.
fn write_order(a: &FailureRecord, b: &FailureRecord) -> Ordering {
    match (&a.fixed_at, &b.fixed_at) {
        (None, None) => a.failed_at.cmp(&b.failed_at).then_with(|| a.cmp(b)),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y).then_with(|| a.cmp(b)),
    }
}

// ============================================================================
// Store
// ============================================================================

/// Failure records for one testable, backed by one CSV file.
#[derive(Debug)]
pub struct FailureStore {
    path: PathBuf,
    names: Vec<String>,
    records: Vec<FailureRecord>,
    max_remembered_fixes: usize,
    skipped_rows: usize,
}

impl FailureStore {
    /// Resolve the file path for a testable. An explicit directory wins;
    /// otherwise the file sits next to the current executable, falling
    /// back to the working directory under the qualified stem when the
    /// executable's directory is unknown or rejects writes.
    pub fn locate(dir: Option<&Path>, stem: &str, qualified_stem: &str) -> PathBuf {
        if let Some(dir) = dir {
            return dir.join(format!("{stem}.{STORE_EXTENSION}"));
        }
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        locate_default(exe_dir.as_deref(), stem, qualified_stem)
    }

    /// Open a store, loading the file when it exists. A missing file is an
    /// empty store; the file appears on the first recorded mutation.
    pub fn open(
        path: PathBuf,
        names: &[String],
        max_remembered_fixes: usize,
    ) -> Result<Self, HarnessError> {
        let mut store = Self {
            path,
            names: names.to_vec(),
            records: Vec::new(),
            max_remembered_fixes,
            skipped_rows: 0,
        };
        store.load()?;
        Ok(store)
    }

    fn load(&mut self) -> Result<(), HarnessError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(HarnessError::store(&self.path, e)),
        };

        let mut columns = self.names.clone();
        let mut saw_header = false;
        for (number, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if number == 0 && line.starts_with(HEADER_PREFIX) {
                saw_header = true;
                columns = line.split(',').skip(4).map(str::to_owned).collect();
                continue;
            }
            match parse_row(line, &columns) {
                Ok(record) => self.records.push(record),
                Err(reason) => {
                    self.skipped_rows += 1;
                    tracing::warn!(
                        path = %self.path.display(),
                        row = number + 1,
                        %reason,
                        "skipping malformed failure record"
                    );
                }
            }
        }
        if !saw_header && !self.records.is_empty() {
            tracing::warn!(
                path = %self.path.display(),
                "failure file has no header row; parsed with configured columns"
            );
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows dropped as malformed during the last load.
    pub fn skipped_rows(&self) -> usize {
        self.skipped_rows
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &FailureRecord> {
        self.records.iter().filter(|r| !r.is_resolved())
    }

    pub fn resolved(&self) -> impl Iterator<Item = &FailureRecord> {
        self.records.iter().filter(|r| r.is_resolved())
    }

    // ------------------------------------------------------------------
    // Mutations (each rewrites the file)
    // ------------------------------------------------------------------

    /// Record a fresh failure. A failure matching a resolved record is that
    /// record regressing; one matching an unresolved record is already
    /// known and left untouched.
    pub fn record_failure(&mut self, record: FailureRecord) -> Result<(), HarnessError> {
        if let Some(i) = self.find_same(&record) {
            if self.records[i].is_resolved() {
                tracing::warn!(
                    seed = record.seed,
                    position = record.position,
                    "resolved failure regressed"
                );
                self.records[i].fixed_at = None;
                return self.save();
            }
            tracing::debug!(seed = record.seed, "failure already on record");
            return Ok(());
        }
        self.records.push(record);
        self.save()
    }

    /// Mark a replayed record as fixed.
    pub fn mark_fixed(
        &mut self,
        record: &FailureRecord,
        at: NaiveDateTime,
    ) -> Result<(), HarnessError> {
        match self.find_same(record) {
            Some(i) => {
                self.records[i].fixed_at = Some(at);
                self.save()
            }
            None => {
                tracing::warn!(seed = record.seed, "record to mark fixed is gone");
                Ok(())
            }
        }
    }

    /// Clear a resolved record's fix: the failure came back.
    pub fn mark_regressed(&mut self, record: &FailureRecord) -> Result<(), HarnessError> {
        match self.find_same(record) {
            Some(i) => {
                self.records[i].fixed_at = None;
                self.save()
            }
            None => {
                tracing::warn!(seed = record.seed, "record to mark regressed is gone");
                Ok(())
            }
        }
    }

    /// Replace a record's failure coordinates with fresh evidence: the same
    /// seed now fails at a different position. The original failure time is
    /// kept.
    pub fn update_position(
        &mut self,
        record: &FailureRecord,
        position: u64,
        placemarks: BTreeMap<String, u64>,
    ) -> Result<(), HarnessError> {
        match self.find_same(record) {
            Some(i) => {
                self.records[i].position = position;
                self.records[i].placemarks = placemarks;
                self.records[i].fixed_at = None;
                self.save()
            }
            None => {
                tracing::warn!(seed = record.seed, "record to update is gone");
                Ok(())
            }
        }
    }

    fn find_same(&self, record: &FailureRecord) -> Option<usize> {
        self.records.iter().position(|r| r.same_case(record))
    }

    fn save(&mut self) -> Result<(), HarnessError> {
        self.evict_excess_fixes();
        self.records.sort_by(write_order);

        let mut out = String::from(HEADER_PREFIX);
        for name in &self.names {
            out.push(',');
            out.push_str(name);
        }
        out.push('\n');
        for record in &self.records {
            out.push_str(&format_row(record, &self.names));
            out.push('\n');
        }
        fs::write(&self.path, out).map_err(|e| HarnessError::store(&self.path, e))
    }

    fn evict_excess_fixes(&mut self) {
        loop {
            let fixed: Vec<usize> = self
                .records
                .iter()
                .enumerate()
                .filter_map(|(i, r)| r.is_resolved().then_some(i))
                .collect();
            if fixed.len() <= self.max_remembered_fixes {
                return;
            }
            let oldest = fixed
                .into_iter()
                .min_by_key(|&i| self.records[i].fixed_at);
            if let Some(i) = oldest {
                let dropped = self.records.remove(i);
                tracing::debug!(
                    seed = dropped.seed,
                    position = dropped.position,
                    "evicting oldest resolved failure"
                );
            } else {
                return;
            }
        }
    }
}

/// Default placement: next to the executable when that location accepts
/// writes, else the working directory under the qualified stem.
fn locate_default(exe_dir: Option<&Path>, stem: &str, qualified_stem: &str) -> PathBuf {
    if let Some(dir) = exe_dir {
        let candidate = dir.join(format!("{stem}.{STORE_EXTENSION}"));
        if accepts_writes(&candidate) {
            return candidate;
        }
        tracing::debug!(
            path = %candidate.display(),
            "store location rejects writes; using the working directory"
        );
    }
    PathBuf::from(format!("{qualified_stem}.{STORE_EXTENSION}"))
}

/// True when `path` accepts an append-mode open. Appending never truncates
/// an existing store, and a file this check creates is removed again so a
/// clean run leaves nothing behind.
fn accepts_writes(path: &Path) -> bool {
    match fs::OpenOptions::new().append(true).open(path) {
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let created = fs::OpenOptions::new()
                .append(true)
                .create_new(true)
                .open(path);
            match created {
                Ok(file) => {
                    drop(file);
                    let _ = fs::remove_file(path);
                    true
                }
                Err(_) => false,
            }
        }
        Err(_) => false,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, day)
            .unwrap()
            .and_hms_opt(hour, 30, 0)
            .unwrap()
    }

    fn names() -> Vec<String> {
        vec!["connect".to_string(), "transfer".to_string()]
    }

    fn record(seed: u64, position: u64) -> FailureRecord {
        let mut marks = BTreeMap::new();
        marks.insert("connect".to_string(), 17);
        FailureRecord::new(seed, position, marks, ts(25, 14))
    }

    #[test]
    fn row_round_trip_unresolved() {
        let rec = record(0x1a2b, 442);
        let row = format_row(&rec, &names());
        assert_eq!(row, "25Aug2026 14:30:00,,1a2b,442,17,");
        assert_eq!(parse_row(&row, &names()).unwrap(), rec);
    }

    #[test]
    fn row_round_trip_resolved() {
        let mut rec = record(0xff, 90);
        rec.fixed_at = Some(ts(26, 10));
        let row = format_row(&rec, &names());
        assert_eq!(row, "25Aug2026 14:30:00,26Aug2026 10:30:00,ff,90,17,");
        assert_eq!(parse_row(&row, &names()).unwrap(), rec);
    }

    #[test]
    fn blank_placemark_columns_stay_absent() {
        let rec = FailureRecord::new(7, 10, BTreeMap::new(), ts(25, 9));
        let row = format_row(&rec, &names());
        assert_eq!(row, "25Aug2026 09:30:00,,7,10,,");
        let parsed = parse_row(&row, &names()).unwrap();
        assert!(parsed.placemarks.is_empty());
    }

    #[test]
    fn malformed_rows_are_descriptive_errors() {
        assert!(parse_row("garbage", &names()).is_err());
        assert!(parse_row("25Aug2026 14:30:00,,zzz,1,,", &names()).is_err());
        assert!(parse_row("25Aug2026 14:30:00,,1a,notanumber,,", &names()).is_err());
        assert!(parse_row("not a date,,1a,1,,", &names()).is_err());
    }

    #[test]
    fn write_order_puts_unresolved_first_by_failure_time() {
        let mut newer = record(1, 10);
        newer.failed_at = ts(26, 8);
        let older = record(2, 20); // failed on the 25th
        let mut fixed_early = record(3, 30);
        fixed_early.fixed_at = Some(ts(25, 20));
        let mut fixed_late = record(4, 40);
        fixed_late.fixed_at = Some(ts(26, 20));

        let mut rows = vec![
            fixed_late.clone(),
            newer.clone(),
            fixed_early.clone(),
            older.clone(),
        ];
        rows.sort_by(write_order);
        assert_eq!(rows, vec![older, newer, fixed_early, fixed_late]);
    }

    #[test]
    fn record_identity_ignores_history() {
        let a = record(1, 10);
        let mut b = a.clone();
        b.failed_at = ts(26, 1);
        b.fixed_at = Some(ts(26, 2));
        assert!(a.same_case(&b));
        let mut c = a.clone();
        c.position = 11;
        assert!(!a.same_case(&c));
    }

    #[test]
    fn self_order_is_by_position_then_seed() {
        let mut rows = vec![record(2, 20), record(9, 10), record(1, 10)];
        rows.sort();
        let key: Vec<(u64, u64)> = rows.iter().map(|r| (r.position, r.seed)).collect();
        assert_eq!(key, vec![(10, 1), (10, 9), (20, 2)]);
    }

    #[test]
    fn locate_prefers_explicit_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = FailureStore::locate(Some(dir.path()), "widget", "pkg.widget");
        assert_eq!(path, dir.path().join("widget.broken"));
    }

    #[test]
    fn default_location_sits_next_to_the_executable_when_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = locate_default(Some(dir.path()), "widget", "pkg.widget");
        assert_eq!(path, dir.path().join("widget.broken"));
        // The writability check must not leave a file behind.
        assert!(!path.exists());
    }

    #[test]
    fn unwritable_executable_directory_falls_back_to_qualified_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-subdir");
        let path = locate_default(Some(&missing), "widget", "pkg.widget");
        assert_eq!(path, PathBuf::from("pkg.widget.broken"));
    }

    #[test]
    fn unknown_executable_directory_falls_back_to_qualified_cwd() {
        let path = locate_default(None, "widget", "pkg.widget");
        assert_eq!(path, PathBuf::from("pkg.widget.broken"));
    }

    #[test]
    fn writability_check_leaves_existing_stores_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("widget.broken");
        fs::write(&path, "Failed,Fixed,Seed,Position\n").unwrap();
        assert!(accepts_writes(&path));
        let kept = fs::read_to_string(&path).unwrap();
        assert_eq!(kept, "Failed,Fixed,Seed,Position\n");
    }
}

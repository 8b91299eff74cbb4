// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for partitioning test files across several CI workers.
//!
//! Files with historical timings are bin-packed into partitions by decreasing first-fit: the
//! longest files go first, each into the first partition with room for it. A file that fits
//! nowhere goes to the partition with the most remaining capacity. Files without timings are
//! dealt out round-robin.
//!
//! Partitioning is stateless: every worker computes the full plan from the same file list and
//! timing manifest, then keeps only its own partition.

use crate::{
    backend::{TestFileTiming, TimingCatalog},
    errors::PartitionError,
    file_glob::expand_globs,
    helpers::{absolutize, plural},
};
use camino::{Utf8Path, Utf8PathBuf};
use humantime::format_duration;
use std::{collections::HashMap, fmt, io, num::NonZeroUsize, time::Duration};
use tracing::{debug, warn};

/// Configuration for a single partition request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionConfig {
    /// The suite whose timings should be used.
    pub suite_id: String,

    /// Globs to expand into the list of test files.
    pub file_globs: Vec<String>,

    /// The total number of partitions.
    pub total_partitions: usize,

    /// The partition to return, counting up from 0.
    pub index: usize,

    /// The string to join files with when printing.
    pub delimiter: String,

    /// Skip timings entirely and deal every file out round-robin.
    pub round_robin: bool,

    /// A literal prefix to strip from each file path before it's emitted.
    pub trim_prefix: Option<String>,
}

impl PartitionConfig {
    /// The default delimiter.
    pub const DEFAULT_DELIMITER: &'static str = " ";

    /// Checks the partition index and total.
    pub fn validate(&self) -> Result<NonZeroUsize, PartitionError> {
        let total = NonZeroUsize::new(self.total_partitions).ok_or(PartitionError::InvalidTotal)?;
        if self.index >= total.get() {
            return Err(PartitionError::IndexOutOfRange {
                index: self.index,
                total: total.get(),
            });
        }
        Ok(total)
    }
}

/// A server-reported timing bound to the client's path for the same file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileTimingMatch<'a> {
    /// The timing reported by the catalog.
    pub file_timing: &'a TestFileTiming,

    /// The file path as the client knows it.
    pub client_filepath: Utf8PathBuf,
}

impl FileTimingMatch<'_> {
    /// Returns the historical duration of the file.
    pub fn duration(&self) -> Duration {
        self.file_timing.duration
    }
}

/// One of the N partitions being filled.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestPartition {
    index: usize,
    test_file_paths: Vec<Utf8PathBuf>,
    // Signed nanoseconds: the most-remaining-capacity fallback may overfill a partition.
    remaining_capacity: i128,
    total_capacity: Duration,
}

impl TestPartition {
    fn new(index: usize, capacity: Duration) -> Self {
        Self {
            index,
            test_file_paths: Vec::new(),
            remaining_capacity: capacity.as_nanos() as i128,
            total_capacity: capacity,
        }
    }

    /// Returns the index of this partition.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the files assigned to this partition, in assignment order.
    pub fn test_file_paths(&self) -> &[Utf8PathBuf] {
        &self.test_file_paths
    }

    /// Returns the remaining capacity in nanoseconds. May be negative.
    pub fn remaining_capacity(&self) -> i128 {
        self.remaining_capacity
    }

    /// Returns the capacity this partition was created with.
    pub fn total_capacity(&self) -> Duration {
        self.total_capacity
    }

    fn fits(&self, duration: Duration) -> bool {
        self.remaining_capacity >= duration.as_nanos() as i128
    }

    fn add(mut self, file: &FileTimingMatch<'_>) -> Self {
        self.test_file_paths.push(file.client_filepath.clone());
        self.remaining_capacity -= file.duration().as_nanos() as i128;
        self
    }

    fn add_unmatched(mut self, file: &Utf8Path) -> Self {
        self.test_file_paths.push(file.to_owned());
        self
    }
}

/// The result of partitioning a file list: every partition, not just the requested one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionPlan {
    partitions: Vec<TestPartition>,
    total_capacity: Duration,
    partition_capacity: Duration,
    matched_files: usize,
    unmatched_files: usize,
}

impl PartitionPlan {
    /// Returns all partitions, indexed from 0.
    pub fn partitions(&self) -> &[TestPartition] {
        &self.partitions
    }

    /// Returns the sum of the durations of all files with timings.
    pub fn total_capacity(&self) -> Duration {
        self.total_capacity
    }

    /// Returns the target capacity of each partition.
    pub fn partition_capacity(&self) -> Duration {
        self.partition_capacity
    }

    /// Returns the number of files that had timings.
    pub fn matched_files(&self) -> usize {
        self.matched_files
    }

    /// Returns the number of files without timings.
    pub fn unmatched_files(&self) -> usize {
        self.unmatched_files
    }

    /// Returns the number of partitions with at least one file.
    pub fn utilized_partitions(&self) -> usize {
        self.partitions
            .iter()
            .filter(|partition| !partition.test_file_paths.is_empty())
            .count()
    }
}

/// Computes partitions for `files` using `timings`.
///
/// Timing paths and client paths are both resolved against `working_dir` before comparison, so
/// relative and absolute spellings of the same file match.
pub fn calculate_partitions(
    files: &[Utf8PathBuf],
    timings: &[TestFileTiming],
    total_partitions: NonZeroUsize,
    working_dir: &Utf8Path,
) -> PartitionPlan {
    let mut timings_by_path: HashMap<Utf8PathBuf, &TestFileTiming> = HashMap::new();
    for timing in timings {
        timings_by_path
            .entry(absolutize(working_dir, &timing.filepath))
            .or_insert(timing);
    }

    let mut matched = Vec::new();
    let mut unmatched = Vec::new();
    for file in files {
        match timings_by_path.get(&absolutize(working_dir, file)) {
            Some(file_timing) => matched.push(FileTimingMatch {
                file_timing,
                client_filepath: file.clone(),
            }),
            None => unmatched.push(file.as_path()),
        }
    }

    // Ties break on the client path, in reverse order. Every worker must agree on this order.
    matched.sort_by(|a, b| {
        b.duration()
            .cmp(&a.duration())
            .then_with(|| b.client_filepath.cmp(&a.client_filepath))
    });

    let total_capacity: Duration = matched.iter().map(FileTimingMatch::duration).sum();
    let partition_capacity = Duration::from_nanos(
        (total_capacity.as_nanos() / total_partitions.get() as u128) as u64,
    );
    debug!("Total Capacity: {}", format_duration(total_capacity));
    debug!(
        "Target Partition Capacity: {}",
        format_duration(partition_capacity)
    );

    let mut partitions: Vec<_> = (0..total_partitions.get())
        .map(|index| TestPartition::new(index, partition_capacity))
        .collect();

    if matched.is_empty() && !files.is_empty() {
        warn!("no timing data found for any test file, falling back to round-robin partitioning");
    }

    for file in &matched {
        let index = match partitions
            .iter()
            .position(|partition| partition.fits(file.duration()))
        {
            Some(index) => {
                debug!(
                    "[PARTITION {index}] first fit: {} ({})",
                    file.client_filepath,
                    format_duration(file.duration()),
                );
                index
            }
            None => {
                let index = most_remaining_capacity(&partitions);
                debug!(
                    "[PARTITION {index}] most remaining capacity: {} ({})",
                    file.client_filepath,
                    format_duration(file.duration()),
                );
                index
            }
        };
        let partition = std::mem::take(&mut partitions[index]);
        partitions[index] = partition.add(file);
    }

    for (i, file) in unmatched.iter().enumerate() {
        let index = i % partitions.len();
        debug!("[PARTITION {index}] round robin: {file}");
        let partition = std::mem::take(&mut partitions[index]);
        partitions[index] = partition.add_unmatched(file);
    }

    PartitionPlan {
        partitions,
        total_capacity,
        partition_capacity,
        matched_files: matched.len(),
        unmatched_files: unmatched.len(),
    }
}

/// Returns the index of the partition with the strictly greatest remaining capacity, preferring
/// the lowest index among ties.
fn most_remaining_capacity(partitions: &[TestPartition]) -> usize {
    let mut best = 0;
    for (index, partition) in partitions.iter().enumerate().skip(1) {
        if partition.remaining_capacity > partitions[best].remaining_capacity {
            best = index;
        }
    }
    best
}

/// Computes partitions by fetching timings from a [`TimingCatalog`].
pub struct Partitioner<'a> {
    catalog: &'a dyn TimingCatalog,
    working_dir: Utf8PathBuf,
}

impl fmt::Debug for Partitioner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partitioner")
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl<'a> Partitioner<'a> {
    /// Creates a new partitioner. Globs and paths are resolved against `working_dir`.
    pub fn new(catalog: &'a dyn TimingCatalog, working_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            catalog,
            working_dir: working_dir.into(),
        }
    }

    /// Computes the plan for `config` and returns the files assigned to `config.index`.
    pub fn partition(&self, config: &PartitionConfig) -> Result<Partition, PartitionError> {
        let total_partitions = config.validate()?;

        let files = expand_globs(&self.working_dir, &config.file_globs)?;
        if files.is_empty() {
            return Err(PartitionError::NoFiles {
                globs: config.file_globs.clone(),
            });
        }
        debug!(
            "partitioning {} {} across {} {}",
            files.len(),
            plural::files_str(files.len()),
            total_partitions,
            plural::partitions_str(total_partitions.get()),
        );

        let timings = if config.round_robin {
            Vec::new()
        } else {
            match self.catalog.get_test_timing_manifest(&config.suite_id) {
                Ok(timings) => timings,
                Err(err) => {
                    warn!(
                        "failed to fetch timings for suite `{}`, falling back to round-robin: {err}",
                        config.suite_id,
                    );
                    Vec::new()
                }
            }
        };

        let plan = calculate_partitions(&files, &timings, total_partitions, &self.working_dir);
        let files = plan.partitions[config.index]
            .test_file_paths
            .iter()
            .map(|path| {
                let path = path.as_str();
                match &config.trim_prefix {
                    Some(prefix) => path.strip_prefix(prefix.as_str()).unwrap_or(path),
                    None => path,
                }
                .to_owned()
            })
            .collect();

        Ok(Partition {
            index: config.index,
            files,
            delimiter: config.delimiter.clone(),
            utilized_partitions: plan.utilized_partitions(),
        })
    }
}

/// The files assigned to one partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Partition {
    index: usize,
    files: Vec<String>,
    delimiter: String,
    utilized_partitions: usize,
}

impl Partition {
    /// Returns the index of this partition.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the assigned files.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Returns true if no files were assigned to this partition.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Returns the number of partitions that got at least one file.
    pub fn utilized_partitions(&self) -> usize {
        self.utilized_partitions
    }

    /// Writes the files, joined by the delimiter, followed by a newline.
    pub fn write_to(&self, writer: &mut dyn io::Write) -> io::Result<()> {
        writeln!(writer, "{self}")
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.files.join(&self.delimiter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BackendError;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;
    use proptest::{collection::btree_map, prelude::*};

    const WORK: &str = "/work";

    fn two() -> NonZeroUsize {
        NonZeroUsize::new(2).unwrap()
    }

    fn files(names: &[&str]) -> Vec<Utf8PathBuf> {
        names.iter().map(Utf8PathBuf::from).collect()
    }

    fn timings(entries: &[(&str, u64)]) -> Vec<TestFileTiming> {
        entries
            .iter()
            .map(|(path, nanos)| TestFileTiming::new(*path, Duration::from_nanos(*nanos)))
            .collect()
    }

    fn assigned(plan: &PartitionPlan, index: usize) -> Vec<&str> {
        plan.partitions()[index]
            .test_file_paths()
            .iter()
            .map(|path| path.as_str())
            .collect()
    }

    #[test]
    fn decreasing_first_fit() {
        let plan = calculate_partitions(
            &files(&["a", "b", "c", "d"]),
            &timings(&[("a", 4), ("b", 3), ("c", 2), ("d", 1)]),
            two(),
            Utf8Path::new(WORK),
        );

        assert_eq!(assigned(&plan, 0), vec!["a", "d"]);
        assert_eq!(assigned(&plan, 1), vec!["b", "c"]);
        assert_eq!(format_duration(plan.total_capacity()).to_string(), "10ns");
        assert_eq!(format_duration(plan.partition_capacity()).to_string(), "5ns");
        assert_eq!(plan.partitions()[0].total_capacity(), Duration::from_nanos(5));
        assert_eq!(plan.partitions()[0].remaining_capacity(), 0);
        assert_eq!(plan.partitions()[1].remaining_capacity(), 0);
        assert_eq!(plan.utilized_partitions(), 2);
    }

    #[test]
    fn round_robin_without_timings() {
        let plan = calculate_partitions(
            &files(&["a", "b", "c", "d"]),
            &[],
            two(),
            Utf8Path::new(WORK),
        );

        assert_eq!(assigned(&plan, 0), vec!["a", "c"]);
        assert_eq!(assigned(&plan, 1), vec!["b", "d"]);
        assert_eq!(plan.matched_files(), 0);
        assert_eq!(plan.unmatched_files(), 4);
        assert_eq!(plan.total_capacity(), Duration::ZERO);
    }

    #[test]
    fn overflow_goes_to_most_remaining_capacity() {
        // Capacity is 13 / 2 = 6. a -> 0 (1 left), b -> 1 (2 left), c fits nowhere and goes to
        // partition 1 (most remaining), d -> 0.
        let plan = calculate_partitions(
            &files(&["a", "b", "c", "d"]),
            &timings(&[("a", 5), ("b", 4), ("c", 3), ("d", 1)]),
            two(),
            Utf8Path::new(WORK),
        );

        assert_eq!(assigned(&plan, 0), vec!["a", "d"]);
        assert_eq!(assigned(&plan, 1), vec!["b", "c"]);
        assert_eq!(plan.partitions()[1].remaining_capacity(), -1);
        assert_eq!(plan.partitions()[0].remaining_capacity(), 0);
    }

    #[test]
    fn most_remaining_capacity_prefers_first_on_ties() {
        let partitions = vec![
            TestPartition::new(0, Duration::from_nanos(3)),
            TestPartition::new(1, Duration::from_nanos(3)),
        ];
        assert_eq!(most_remaining_capacity(&partitions), 0);
    }

    #[test]
    fn ties_break_by_reverse_path() {
        let plan = calculate_partitions(
            &files(&["a", "b", "c"]),
            &timings(&[("a", 2), ("b", 2), ("c", 2)]),
            NonZeroUsize::new(3).unwrap(),
            Utf8Path::new(WORK),
        );

        assert_eq!(assigned(&plan, 0), vec!["c"]);
        assert_eq!(assigned(&plan, 1), vec!["b"]);
        assert_eq!(assigned(&plan, 2), vec!["a"]);
    }

    #[test]
    fn matches_relative_and_absolute_paths() {
        let plan = calculate_partitions(
            &files(&["spec/a_spec.rb", "./spec/b_spec.rb", "spec/c_spec.rb"]),
            &timings(&[
                ("/work/spec/a_spec.rb", 10),
                ("spec/b_spec.rb", 5),
                ("/elsewhere/spec/c_spec.rb", 5),
            ]),
            two(),
            Utf8Path::new(WORK),
        );

        assert_eq!(plan.matched_files(), 2);
        assert_eq!(plan.unmatched_files(), 1);
        assert_eq!(assigned(&plan, 0), vec!["spec/a_spec.rb", "spec/c_spec.rb"]);
        assert_eq!(assigned(&plan, 1), vec!["./spec/b_spec.rb"]);
    }

    #[test]
    fn more_partitions_than_files() {
        let plan = calculate_partitions(
            &files(&["a"]),
            &timings(&[("a", 1)]),
            NonZeroUsize::new(3).unwrap(),
            Utf8Path::new(WORK),
        );

        // Capacity is 0, so nothing fits and the fallback picks the first partition.
        assert_eq!(assigned(&plan, 0), vec!["a"]);
        assert_eq!(plan.utilized_partitions(), 1);
    }

    proptest! {
        #[test]
        fn partitions_are_complete_and_disjoint(
            entries in btree_map("[a-z]{1,6}", proptest::option::of(0u64..1_000), 1..40),
            total in 1usize..8,
        ) {
            let files: Vec<_> = entries.keys().map(Utf8PathBuf::from).collect();
            let timings: Vec<_> = entries
                .iter()
                .filter_map(|(path, nanos)| {
                    nanos.map(|nanos| TestFileTiming::new(path.as_str(), Duration::from_nanos(nanos)))
                })
                .collect();

            let plan = calculate_partitions(
                &files,
                &timings,
                NonZeroUsize::new(total).unwrap(),
                Utf8Path::new(WORK),
            );
            prop_assert_eq!(plan.partitions().len(), total);

            let mut seen: Vec<_> = plan
                .partitions()
                .iter()
                .flat_map(|partition| partition.test_file_paths().iter().cloned())
                .collect();
            seen.sort();
            prop_assert_eq!(seen, files);
        }
    }

    struct FakeCatalog(Result<Vec<TestFileTiming>, ()>);

    impl TimingCatalog for FakeCatalog {
        fn get_test_timing_manifest(
            &self,
            _suite_id: &str,
        ) -> Result<Vec<TestFileTiming>, BackendError> {
            self.0.clone().map_err(|()| BackendError::Read {
                path: "timings.json".into(),
                err: io::Error::other("backend unavailable"),
            })
        }
    }

    fn setup_files(names: &[&str]) -> Utf8TempDir {
        let dir = Utf8TempDir::new().unwrap();
        for name in names {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "").unwrap();
        }
        dir
    }

    fn config(index: usize, total: usize) -> PartitionConfig {
        PartitionConfig {
            suite_id: "suite".to_owned(),
            file_globs: vec!["spec/**/*_spec.rb".to_owned()],
            total_partitions: total,
            index,
            delimiter: PartitionConfig::DEFAULT_DELIMITER.to_owned(),
            round_robin: false,
            trim_prefix: None,
        }
    }

    #[test]
    fn partitioner_uses_catalog() {
        let dir = setup_files(&["spec/a_spec.rb", "spec/b_spec.rb", "spec/c_spec.rb", "spec/d_spec.rb"]);
        let catalog = FakeCatalog(Ok(timings(&[
            ("spec/a_spec.rb", 4),
            ("spec/b_spec.rb", 3),
            ("spec/c_spec.rb", 2),
            ("spec/d_spec.rb", 1),
        ])));
        let partitioner = Partitioner::new(&catalog, dir.path());

        let first = partitioner.partition(&config(0, 2)).unwrap();
        assert_eq!(first.files(), ["spec/a_spec.rb", "spec/d_spec.rb"]);
        assert_eq!(first.to_string(), "spec/a_spec.rb spec/d_spec.rb");
        assert_eq!(first.utilized_partitions(), 2);

        let mut round_robin = config(1, 2);
        round_robin.round_robin = true;
        round_robin.delimiter = ",".to_owned();
        round_robin.trim_prefix = Some("spec/".to_owned());
        let second = partitioner.partition(&round_robin).unwrap();
        assert_eq!(second.files(), ["b_spec.rb", "d_spec.rb"]);

        let mut output = Vec::new();
        second.write_to(&mut output).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "b_spec.rb,d_spec.rb\n");
    }

    #[test]
    fn partitioner_falls_back_when_catalog_fails() {
        let dir = setup_files(&["spec/a_spec.rb", "spec/b_spec.rb", "spec/c_spec.rb"]);
        let catalog = FakeCatalog(Err(()));
        let partitioner = Partitioner::new(&catalog, dir.path());

        let partition = partitioner.partition(&config(0, 2)).unwrap();
        assert_eq!(partition.files(), ["spec/a_spec.rb", "spec/c_spec.rb"]);
    }

    #[test]
    fn partitioner_validates_config() {
        let dir = setup_files(&["spec/a_spec.rb"]);
        let catalog = FakeCatalog(Ok(Vec::new()));
        let partitioner = Partitioner::new(&catalog, dir.path());

        assert!(matches!(
            partitioner.partition(&config(0, 0)),
            Err(PartitionError::InvalidTotal)
        ));
        assert!(matches!(
            partitioner.partition(&config(2, 2)),
            Err(PartitionError::IndexOutOfRange { index: 2, total: 2 })
        ));

        let mut no_files = config(0, 2);
        no_files.file_globs = vec!["test/**/*.rb".to_owned()];
        let err = partitioner.partition(&no_files).unwrap_err();
        assert!(matches!(err, PartitionError::NoFiles { .. }), "{err:?}");
        assert_eq!(err.kind(), crate::errors::ErrorKind::Configuration);
    }

    #[test]
    fn unused_partition_is_empty() {
        let dir = setup_files(&["spec/a_spec.rb"]);
        let catalog = FakeCatalog(Ok(Vec::new()));
        let partitioner = Partitioner::new(&catalog, dir.path());

        let partition = partitioner.partition(&config(1, 2)).unwrap();
        assert!(partition.is_empty());
        assert_eq!(partition.utilized_partitions(), 1);
    }

    #[test]
    fn overlapping_globs_assign_each_file_once() {
        let dir = setup_files(&["spec/a_spec.rb"]);
        let catalog = FakeCatalog(Ok(Vec::new()));
        let partitioner = Partitioner::new(&catalog, dir.path());

        let mut overlapping = config(0, 1);
        overlapping.file_globs = vec!["spec/*_spec.rb".to_owned(), "./spec/*_spec.rb".to_owned()];
        let partition = partitioner.partition(&overlapping).unwrap();
        assert_eq!(partition.files(), ["./spec/a_spec.rb"]);
    }
}

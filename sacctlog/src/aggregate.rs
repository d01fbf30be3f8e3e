// Fold job records into per-scope totals.
//
// One pass over the input produces three maps:
//
// - user scope: every billable job, keyed by user
// - group scope: billable jobs whose group denotes the reserved pool (unless the group filter is
//   disabled), keyed by group
// - partition scope: billable jobs keyed by the reclassified partition, keeping only keys that
//   denote the reserved pool
//
// Merging is component-wise addition, so the order of the input does not matter beyond floating
// point summation order.

use crate::pool::ReservedPool;
use crate::record::{read_accounting, Skip};
use crate::usage::{compute_usage, Billing, UsageTriple};
use crate::weights::GpuWeights;
use crate::{JobRecord, Scope};
use anyhow::{Context, Result};
use itertools::Itertools;
use log::debug;
use std::collections::hash_map;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io;
use std::path::Path;

/// Per-entity usage for one scope.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateMap {
    entries: HashMap<String, UsageTriple>,
}

impl AggregateMap {
    pub fn new() -> AggregateMap {
        AggregateMap::default()
    }

    /// Add `usage` to the entry for `key`, creating it if necessary.

    pub fn merge(&mut self, key: &str, usage: UsageTriple) {
        if let Some(entry) = self.entries.get_mut(key) {
            *entry += usage;
        } else {
            self.entries.insert(key.to_string(), usage);
        }
    }

    pub fn merge_map(&mut self, other: &AggregateMap) {
        for (key, usage) in &other.entries {
            self.merge(key, *usage);
        }
    }

    pub fn get(&self, key: &str) -> Option<&UsageTriple> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, UsageTriple> {
        self.entries.iter()
    }

    /// Entries in output order: descending weighted GPU hours, then ascending name.

    pub fn sorted(&self) -> Vec<(&str, &UsageTriple)> {
        self.entries
            .iter()
            .sorted_by(|(a_name, a), (b_name, b)| {
                b.weighted_gpu_hours
                    .total_cmp(&a.weighted_gpu_hours)
                    .then_with(|| a_name.cmp(b_name))
            })
            .map(|(name, usage)| (name.as_str(), usage))
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, UsageTriple)> for AggregateMap {
    fn from_iter<I: IntoIterator<Item = (S, UsageTriple)>>(iter: I) -> AggregateMap {
        let mut map = AggregateMap::new();
        for (key, usage) in iter {
            map.merge(&key.into(), usage);
        }
        map
    }
}

/// The three maps of one run.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregates {
    pub partition: AggregateMap,
    pub group: AggregateMap,
    pub user: AggregateMap,
}

impl Aggregates {
    pub fn scope(&self, scope: Scope) -> &AggregateMap {
        match scope {
            Scope::Partition => &self.partition,
            Scope::Group => &self.group,
            Scope::User => &self.user,
        }
    }

    pub fn scope_mut(&mut self, scope: Scope) -> &mut AggregateMap {
        match scope {
            Scope::Partition => &mut self.partition,
            Scope::Group => &mut self.group,
            Scope::User => &mut self.user,
        }
    }
}

/// GPU volume that was left out because its class has no weight.

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExcludedVolume {
    pub jobs: usize,
    pub gpu_hours: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub lines_read: usize,
    pub not_qualifying: usize,
    pub malformed: usize,
    pub no_gpu_count: usize,

    /// Keyed by the last GPU type named by the job, or `<untyped>` if it names none.
    pub unknown_class: BTreeMap<String, ExcludedVolume>,

    pub aggregated: usize,
}

pub const UNTYPED_CLASS: &str = "<untyped>";

impl RunStats {
    pub fn unknown_class_jobs(&self) -> usize {
        self.unknown_class.values().map(|v| v.jobs).sum()
    }
}

/// Owned state of one aggregation pass.

pub struct Aggregator<'a> {
    weights: &'a GpuWeights,
    pool: &'a ReservedPool,
    group_filter: Option<String>,
    aggregates: Aggregates,
    stats: RunStats,
}

impl<'a> Aggregator<'a> {
    /// An empty `group_filter` is the same as none: every group is kept.

    pub fn new(weights: &'a GpuWeights, pool: &'a ReservedPool, group_filter: Option<&str>) -> Aggregator<'a> {
        Aggregator {
            weights,
            pool,
            group_filter: group_filter.filter(|f| !f.is_empty()).map(|f| f.to_string()),
            aggregates: Aggregates::default(),
            stats: RunStats::default(),
        }
    }

    /// Account for one input line, already parsed.  Fails only if the job has GPUs and a bad
    /// elapsed time.

    pub fn add_record(&mut self, line: usize, parsed: Result<JobRecord, Skip>) -> Result<()> {
        self.stats.lines_read += 1;
        let job = match parsed {
            Ok(job) => job,
            Err(skip) => {
                debug!("Line {line}: skipped, {skip:?}");
                match skip {
                    Skip::NotQualifying => self.stats.not_qualifying += 1,
                    Skip::Malformed => self.stats.malformed += 1,
                }
                return Ok(());
            }
        };
        let billing = compute_usage(&job, self.weights)
            .with_context(|| format!("Line {line}: job of user `{}`", job.user_id))?;
        match billing {
            Billing::NoGpuCount => {
                debug!("Line {line}: no GPU count in `{}`", job.resource_spec);
                self.stats.no_gpu_count += 1;
            }
            Billing::UnknownClass { classes, gpu_hours } => {
                debug!("Line {line}: no weight for GPU types {classes:?}");
                let class = classes.last().map(|c| c.as_str()).unwrap_or(UNTYPED_CLASS);
                let volume = self.stats.unknown_class.entry(class.to_string()).or_default();
                volume.jobs += 1;
                volume.gpu_hours += gpu_hours;
            }
            Billing::Billable(usage) => {
                self.aggregates.user.merge(&job.user_id, usage);
                let keep_group = match &self.group_filter {
                    Some(filter) => job.group_id.contains(filter.as_str()),
                    None => true,
                };
                if keep_group {
                    self.aggregates.group.merge(&job.group_id, usage);
                }
                let partition = self.pool.classify(&job.node_name, &job.partition_id);
                if self.pool.denotes_pool(partition) {
                    self.aggregates.partition.merge(partition, usage);
                }
                self.stats.aggregated += 1;
            }
        }
        Ok(())
    }

    /// Parse and account for one line of text.

    pub fn add_line(&mut self, line: usize, text: &str) -> Result<()> {
        self.add_record(line, crate::record::parse_line(text))
    }

    pub fn finish(self) -> (Aggregates, RunStats) {
        (self.aggregates, self.stats)
    }
}

/// Aggregate a whole accounting stream.

pub fn aggregate_accounting<R: io::Read>(
    input: R,
    weights: &GpuWeights,
    pool: &ReservedPool,
    group_filter: Option<&str>,
) -> Result<(Aggregates, RunStats)> {
    let mut aggregator = Aggregator::new(weights, pool, group_filter);
    read_accounting(input, |line, parsed| aggregator.add_record(line, parsed))?;
    Ok(aggregator.finish())
}

pub fn aggregate_file(
    path: &Path,
    weights: &GpuWeights,
    pool: &ReservedPool,
    group_filter: Option<&str>,
) -> Result<(Aggregates, RunStats)> {
    let file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
    aggregate_accounting(file, weights, pool, group_filter)
        .with_context(|| format!("Reading {}", path.display()))
}

#[cfg(test)]
use std::collections::HashSet;

#[cfg(test)]
fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

#[cfg(test)]
fn day1_pool() -> ReservedPool {
    ReservedPool::new(
        "kempner",
        "non-kempner",
        HashSet::from(["holygpu8a11101".to_string(), "holygpu8a11102".to_string()]),
    )
}

#[cfg(test)]
fn triple(e: f64, g: f64, w: f64) -> UsageTriple {
    UsageTriple { elapsed_hours: e, gpu_hours: g, weighted_gpu_hours: w }
}

#[test]
fn test_merge() {
    let mut m = AggregateMap::new();
    m.merge("a", triple(1.0, 2.0, 3.0));
    m.merge("b", triple(1.0, 1.0, 1.0));
    m.merge("a", triple(1.0, 2.0, 3.0));
    assert!(m.len() == 2);
    assert!(*m.get("a").unwrap() == triple(2.0, 4.0, 6.0));

    let mut n = AggregateMap::from_iter([("b", triple(1.0, 1.0, 1.0)), ("c", triple(0.0, 0.0, 9.0))]);
    n.merge_map(&m);
    assert!(*n.get("b").unwrap() == triple(2.0, 2.0, 2.0));
    assert!(n.sorted().iter().map(|(k, _)| *k).collect::<Vec<&str>>() == vec!["c", "a", "b"]);
}

#[test]
fn test_sorted_ties() {
    let m = AggregateMap::from_iter([
        ("zed", triple(1.0, 1.0, 5.0)),
        ("amy", triple(1.0, 1.0, 5.0)),
        ("max", triple(1.0, 1.0, 7.0)),
    ]);
    assert!(m.sorted().iter().map(|(k, _)| *k).collect::<Vec<&str>>() == vec!["max", "amy", "zed"]);
}

#[test]
fn test_aggregate_day1() {
    let weights = GpuWeights::default();
    let pool = day1_pool();
    let (agg, stats) =
        aggregate_file(Path::new("../sacct_test_data/day1.txt"), &weights, &pool, Some("kempner")).unwrap();

    assert!(stats.lines_read == 11);
    assert!(stats.not_qualifying == 4);
    assert!(stats.malformed == 1);
    assert!(stats.no_gpu_count == 1);
    assert!(stats.aggregated == 4);
    assert!(stats.unknown_class_jobs() == 1);
    let a40 = stats.unknown_class.get("nvidia_a40").unwrap();
    assert!(a40.jobs == 1 && close(a40.gpu_hours, 2.0));

    assert!(agg.user.len() == 3);
    let alice = agg.user.get("alice").unwrap();
    assert!(close(alice.elapsed_hours, 7.0 / 6.0));
    assert!(close(alice.gpu_hours, 7.0 / 3.0));
    assert!(close(alice.weighted_gpu_hours, 1093.8 + 182.3));
    let bob = agg.user.get("bob").unwrap();
    assert!(close(bob.gpu_hours, 24.0));
    assert!(close(bob.weighted_gpu_hours, 5018.4));
    assert!(close(agg.user.get("carol").unwrap().weighted_gpu_hours, 418.2));

    // smith_lab is filtered out of the group scope
    assert!(agg.group.len() == 1);
    let lab = agg.group.get("kempner_lab").unwrap();
    assert!(close(lab.gpu_hours, 13.0 / 3.0));
    assert!(close(lab.weighted_gpu_hours, 1694.3));

    // carol's job in `gpu` on a non-pool node is dropped from the partition scope
    assert!(agg.partition.len() == 3);
    assert!(close(agg.partition.get("kempner").unwrap().weighted_gpu_hours, 1093.8));
    assert!(close(agg.partition.get("non-kempner").unwrap().weighted_gpu_hours, 5018.4));
    assert!(close(agg.partition.get("kempner_requeue").unwrap().gpu_hours, 1.0 / 3.0));
    assert!(agg.partition.get("gpu").is_none());
}

#[test]
fn test_aggregate_no_filter_no_nodes() {
    let weights = GpuWeights::default();
    let pool = ReservedPool::default();
    let (agg, _) =
        aggregate_file(Path::new("../sacct_test_data/day1.txt"), &weights, &pool, Some("")).unwrap();
    assert!(agg.group.len() == 2);
    assert!(agg.group.get("smith_lab").is_some());

    // Nothing is reclassified, so bob's job stays in `gpu` and is not kept
    assert!(agg.partition.len() == 2);
    assert!(agg.partition.get("non-kempner").is_none());
}

#[test]
fn test_aggregate_order_independent() {
    let weights = GpuWeights::default();
    let pool = day1_pool();
    let text = std::fs::read_to_string("../sacct_test_data/day1.txt").unwrap();
    let lines = text.lines().collect::<Vec<&str>>();

    let mut forward = Aggregator::new(&weights, &pool, Some("kempner"));
    for (i, l) in lines.iter().enumerate() {
        forward.add_line(i + 1, l).unwrap();
    }
    let mut backward = Aggregator::new(&weights, &pool, Some("kempner"));
    for (i, l) in lines.iter().enumerate().rev() {
        backward.add_line(i + 1, l).unwrap();
    }
    let (f, fs) = forward.finish();
    let (b, bs) = backward.finish();
    assert!(fs == bs);
    for scope in Scope::ALL {
        assert!(f.scope(scope).len() == b.scope(scope).len());
        for (k, u) in f.scope(scope).iter() {
            let v = b.scope(scope).get(k).unwrap();
            assert!(close(u.weighted_gpu_hours, v.weighted_gpu_hours));
            assert!(close(u.gpu_hours, v.gpu_hours));
        }
    }
}

#[test]
fn test_aggregate_bad_elapsed() {
    let weights = GpuWeights::default();
    let pool = ReservedPool::default();
    let input = "1|x|bob|lab|gpu|1:00|gres/gpu:a100=1,gres/gpu=1|n1|COMPLETED\n";
    let err = aggregate_accounting(input.as_bytes(), &weights, &pool, None).unwrap_err();
    assert!(format!("{err:#}").contains("Line 1"));

    // Blank lines count toward the line number
    let input = "\n1|x|bob|lab|gpu|01:00:00|gres/gpu:a100=1,gres/gpu=1|n1|COMPLETED\n\n1|x|bob|lab|gpu|1:00|gres/gpu:a100=1,gres/gpu=1|n1|COMPLETED\n";
    let err = aggregate_accounting(input.as_bytes(), &weights, &pool, None).unwrap_err();
    assert!(format!("{err:#}").contains("Line 4:"));

    // A job without GPU count never looks at elapsed
    let input = "1|x|bob|lab|gpu|1:00|cpu=1|n1|COMPLETED\n";
    let (_, stats) = aggregate_accounting(input.as_bytes(), &weights, &pool, None).unwrap();
    assert!(stats.no_gpu_count == 1);
}

#[test]
fn test_zero_gpu_contributes_nothing() {
    let weights = GpuWeights::default();
    let pool = ReservedPool::default();
    let input = "1|x|bob|kempner|kempner|05:00:00|gres/gpu:a100=0,gres/gpu=0|n1|COMPLETED\n";
    let (agg, _) = aggregate_accounting(input.as_bytes(), &weights, &pool, None).unwrap();
    for scope in Scope::ALL {
        assert!(agg.scope(scope).is_empty());
    }
}

// The daily run: aggregate one accounting file, fold it into the cumulative snapshots, and write the
// dictionary files (and optionally the metrics file) to the output directory.
//
// Nothing is written until the input has been aggregated and the old cumulative files have been
// read, so a bad input or a corrupt cumulative file leaves the output directory untouched.  Daily
// files are written before the cumulative files.
//
// Daily files label each entity with its cumulative index.  Without merging, the cumulative files
// are not updated, and entities they don't know yet are written without an index rather than with
// one a later merging run might not give them.

use crate::configs::Settings;
use anyhow::{Context, Result};
use log::{info, warn};
use sacctlog::{
    aggregate_file, daily_path, render_metrics, replace_file, reserved_nodes_or_empty, store_aggregate,
    Aggregates, NodeSource, ReservedPool, RunStats, Scope, Snapshots,
};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

pub struct RollupArgs {
    pub input: PathBuf,
    pub output_dir: PathBuf,

    /// Update the cumulative files.
    pub merge: bool,

    pub metrics_file: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Rollup {
    pub daily: Aggregates,

    /// The cumulative totals including `daily`, whether or not they were stored.
    pub cumulative: Snapshots,

    pub stats: RunStats,
    pub written: Vec<PathBuf>,
}

pub fn aggregate_and_store(args: &RollupArgs, settings: &Settings, nodes: &dyn NodeSource) -> Result<Rollup> {
    let pool = ReservedPool::new(&settings.pool_label, &settings.fallback_label, reserved_nodes_or_empty(nodes));
    info!(
        "{} nodes in the `{}` pool, jobs from other partitions on them count as `{}`",
        pool.node_count(),
        pool.label(),
        pool.fallback()
    );

    info!("Reading {}", args.input.display());
    let (daily, stats) = aggregate_file(
        &args.input,
        &settings.weights,
        &pool,
        settings.group_filter.as_deref(),
    )?;
    log_stats(&stats);

    let previous = Snapshots::load(&args.output_dir)?;
    let cumulative = previous.merge_all(&daily)?;
    let stored = if args.merge { &cumulative } else { &previous };

    let metrics = match &args.metrics_file {
        Some(path) => {
            let mut text = vec![];
            render_metrics(&mut text, &daily, stored)?;
            Some((path, text))
        }
        None => None,
    };

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Creating {}", args.output_dir.display()))?;
    let mut written = vec![];
    for scope in Scope::ALL {
        let path = daily_path(&args.output_dir, scope);
        store_aggregate(&path, daily.scope(scope), Some(stored.scope(scope)))?;
        written.push(path);
    }
    if args.merge {
        written.extend(cumulative.store(&args.output_dir)?);
    }
    if let Some((path, text)) = metrics {
        replace_file(path, |out| out.write_all(&text))?;
        written.push(path.clone());
    }
    for path in &written {
        info!("Wrote {}", path.display());
    }

    Ok(Rollup {
        daily,
        cumulative,
        stats,
        written,
    })
}

fn log_stats(stats: &RunStats) {
    info!(
        "{} lines: {} jobs aggregated, {} not finished GPU jobs, {} malformed, {} without GPU count, {} with unknown GPU type",
        stats.lines_read,
        stats.aggregated,
        stats.not_qualifying,
        stats.malformed,
        stats.no_gpu_count,
        stats.unknown_class_jobs()
    );
    for (class, volume) in &stats.unknown_class {
        warn!(
            "No weight for GPU type `{class}`: {} jobs, {:.1} GPU hours left out",
            volume.jobs, volume.gpu_hours
        );
    }
}

#[cfg(test)]
use sacctlog::{FileNodes, StaticNodes};

#[cfg(test)]
fn pool_nodes() -> StaticNodes {
    StaticNodes::new(["holygpu8a11101", "holygpu8a11102"])
}

#[cfg(test)]
fn args_for(input: &str, dir: &std::path::Path) -> RollupArgs {
    RollupArgs {
        input: PathBuf::from(input),
        output_dir: dir.to_path_buf(),
        merge: true,
        metrics_file: None,
    }
}

#[cfg(test)]
fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

#[test]
fn test_running_and_completed() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sacct.txt");
    fs::write(
        &input,
        "3001|train|alice|kempner_lab|kempner|00:10:00|cpu=8,gres/gpu:h100=2,gres/gpu=2|holygpu8a11101|RUNNING\n\
         3002|train|alice|kempner_lab|kempner|00:10:00|cpu=8,gres/gpu:h100=2,gres/gpu=2|holygpu8a11101|COMPLETED\n",
    )
    .unwrap();
    let out = dir.path().join("out");
    let args = RollupArgs {
        input,
        output_dir: out.clone(),
        merge: true,
        metrics_file: None,
    };
    let rollup = aggregate_and_store(&args, &Settings::default(), &StaticNodes::default()).unwrap();
    assert!(rollup.stats.aggregated == 1);
    assert!(rollup.written.len() == 6);

    let text = fs::read_to_string(out.join("user_dictionary.csv")).unwrap();
    assert!(text == "name= alice , gpu_hours= 0.3, gpu_tres_hours= 182.3, elapsed_hours= 0.2, index= 1 \n");
}

#[test]
fn test_two_days() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default();

    aggregate_and_store(&args_for("../sacct_test_data/day1.txt", dir.path()), &settings, &pool_nodes()).unwrap();
    let day2 = aggregate_and_store(&args_for("../sacct_test_data/day2.txt", dir.path()), &settings, &pool_nodes()).unwrap();

    let users = Snapshots::load(dir.path()).unwrap().user;
    assert!(users.index_of("bob") == Some(1));
    assert!(users.index_of("alice") == Some(2));
    assert!(users.index_of("carol") == Some(3));
    assert!(users.index_of("grace") == Some(4));
    assert!(close(users.get("alice").unwrap().usage.weighted_gpu_hours, 1276.1 + 1093.8));
    assert!(close(users.get("bob").unwrap().usage.gpu_hours, 24.0));
    assert!(day2.cumulative.user.len() == 4);

    let partitions = Snapshots::load(dir.path()).unwrap().partition;
    assert!(partitions.index_of("non-kempner") == Some(1));
    assert!(partitions.index_of("kempner") == Some(2));
    assert!(close(partitions.get("kempner").unwrap().usage.weighted_gpu_hours, 1093.8 + 1093.8 + 418.2));

    // The daily file holds only the day, labeled with the cumulative index
    let text = fs::read_to_string(dir.path().join("user_dictionary.csv")).unwrap();
    assert!(text.lines().count() == 2);
    assert!(text.starts_with("name= alice , gpu_hours= 2.0, gpu_tres_hours= 1093.8, elapsed_hours= 2.0, index= 2 \n"));
}

#[test]
fn test_no_merge_and_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let metrics = dir.path().join("gpuacct.prom");
    let args = RollupArgs {
        merge: false,
        metrics_file: Some(metrics.clone()),
        ..args_for("../sacct_test_data/day1.txt", dir.path())
    };
    let rollup = aggregate_and_store(&args, &Settings::default(), &pool_nodes()).unwrap();
    assert!(rollup.written.len() == 4);
    assert!(!dir.path().join("user_dictionary_sum.csv").exists());
    assert!(dir.path().join("partition_dictionary.csv").exists());

    // Only the daily families have samples, there are no totals on disk yet
    let text = fs::read_to_string(&metrics).unwrap();
    assert!(text.lines().filter(|l| l.starts_with("# TYPE")).count() == 6);
    assert!(text.contains("day_gpu_tres_user_hours{index=\"A1\",name_id=\"bob\"}"));
    assert!(!text.contains("tot_gpu_user_hours"));
}

#[test]
fn test_no_merge_leaves_new_names_unindexed() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default();
    aggregate_and_store(&args_for("../sacct_test_data/day1.txt", dir.path()), &settings, &pool_nodes()).unwrap();

    let args = RollupArgs {
        merge: false,
        ..args_for("../sacct_test_data/day2.txt", dir.path())
    };
    aggregate_and_store(&args, &settings, &pool_nodes()).unwrap();
    let text = fs::read_to_string(dir.path().join("user_dictionary.csv")).unwrap();
    assert!(
        text == "name= alice , gpu_hours= 2.0, gpu_tres_hours= 1093.8, elapsed_hours= 2.0, index= 2 \n\
                 name= grace , gpu_hours= 2.0, gpu_tres_hours= 418.2, elapsed_hours= 1.0 \n"
    );

    // A later merging run still gives grace the next index
    aggregate_and_store(&args_for("../sacct_test_data/day2.txt", dir.path()), &settings, &pool_nodes()).unwrap();
    let users = Snapshots::load(dir.path()).unwrap().user;
    assert!(users.index_of("grace") == Some(4));
}

#[test]
fn test_node_lookup_failure() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = FileNodes::new("../sacct_test_data/no-such-nodes.txt");
    let rollup = aggregate_and_store(&args_for("../sacct_test_data/day1.txt", dir.path()), &Settings::default(), &nodes).unwrap();
    assert!(rollup.daily.partition.get("non-kempner").is_none());
    assert!(rollup.daily.partition.get("kempner").is_some());
    assert!(rollup.daily.user.len() == 3);
}

#[test]
fn test_failures_write_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("bad.txt");
    fs::write(&input, "1|x|bob|lab|gpu|10:00|gres/gpu:a100=1,gres/gpu=1|n1|COMPLETED\n").unwrap();
    let out = dir.path().join("out");
    let args = RollupArgs {
        input,
        output_dir: out.clone(),
        merge: true,
        metrics_file: None,
    };
    assert!(aggregate_and_store(&args, &Settings::default(), &pool_nodes()).is_err());
    assert!(!out.exists());

    // A corrupt cumulative file
    let dir = tempfile::tempdir().unwrap();
    fs::copy("../sacct_test_data/bad_snapshot.csv", dir.path().join("user_dictionary_sum.csv")).unwrap();
    let err = aggregate_and_store(&args_for("../sacct_test_data/day1.txt", dir.path()), &Settings::default(), &pool_nodes())
        .unwrap_err();
    assert!(format!("{err:#}").contains("user_dictionary_sum.csv:2"));
    assert!(!dir.path().join("user_dictionary.csv").exists());
}

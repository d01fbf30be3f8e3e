// Render the daily and cumulative totals in the Prometheus text exposition format, for a textfile
// collector to pick up.
//
// There are twelve gauge families: {day, tot} x {part, group, user} x {raw, weighted}, named eg
// `day_gpu_part_hours` and `tot_gpu_tres_user_hours`.  Every sample carries the labels
// `name_id="<entity>"` and `index="A<n>"`, where n is the entity's cumulative index.  Daily samples
// use the same index as the cumulative ones, so the two windows can be joined on the label.
//
// All families are registered, but the encoder leaves out a family that has no samples, so an
// empty scope contributes no `# HELP`/`# TYPE` lines.  Families come out sorted by name.

use crate::aggregate::{AggregateMap, Aggregates};
use crate::snapshot::{CumulativeSnapshot, Snapshots};
use crate::usage::UsageTriple;
use crate::Scope;
use anyhow::Result;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::io::Write;

const LABELS: [&str; 2] = ["name_id", "index"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Day,
    Total,
}

impl Window {
    fn prefix(self) -> &'static str {
        match self {
            Window::Day => "day",
            Window::Total => "tot",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Window::Day => "over the last run",
            Window::Total => "cumulative",
        }
    }
}

pub fn metric_name(window: Window, scope: Scope, weighted: bool) -> String {
    format!(
        "{}_gpu{}_{}_hours",
        window.prefix(),
        if weighted { "_tres" } else { "" },
        scope.metric_infix()
    )
}

/// Build a registry holding all twelve families.  `cumulative` should already include `daily`; a
/// daily entity it does not know is labeled with the index it would get when merged.

pub fn metrics_registry(daily: &Aggregates, cumulative: &Snapshots) -> prometheus::Result<Registry> {
    let registry = Registry::new();
    for scope in Scope::ALL {
        let samples = daily_samples(cumulative.scope(scope), daily.scope(scope));
        register_pair(&registry, Window::Day, scope, &samples)?;
    }
    for scope in Scope::ALL {
        let samples = cumulative
            .scope(scope)
            .iter()
            .map(|e| (e.name.as_str(), e.index, &e.usage))
            .collect::<Vec<_>>();
        register_pair(&registry, Window::Total, scope, &samples)?;
    }
    Ok(registry)
}

/// Write the exposition text for `daily` and `cumulative`, see `metrics_registry`.

pub fn render_metrics(out: &mut dyn Write, daily: &Aggregates, cumulative: &Snapshots) -> Result<()> {
    let registry = metrics_registry(daily, cumulative)?;
    let mut buffer = vec![];
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    out.write_all(&buffer)?;
    Ok(())
}

// New names are numbered from the snapshot's next index in output order, as a merge would.

fn daily_samples<'a>(
    indices: &CumulativeSnapshot,
    daily: &'a AggregateMap,
) -> Vec<(&'a str, u32, &'a UsageTriple)> {
    let mut next = indices.next_index();
    daily
        .sorted()
        .into_iter()
        .map(|(name, usage)| {
            let index = indices.index_of(name).unwrap_or_else(|| {
                let n = next;
                next = next.saturating_add(1);
                n
            });
            (name, index, usage)
        })
        .collect()
}

fn register_pair(
    registry: &Registry,
    window: Window,
    scope: Scope,
    samples: &[(&str, u32, &UsageTriple)],
) -> prometheus::Result<()> {
    for weighted in [false, true] {
        let what = if weighted { "Weighted GPU hours" } else { "GPU hours" };
        let help = format!("{what} per {}, {}", scope.file_stem(), window.help());
        let gauges = GaugeVec::new(Opts::new(metric_name(window, scope, weighted), help), &LABELS)?;
        for &(entity, index, usage) in samples {
            let value = if weighted { usage.weighted_gpu_hours } else { usage.gpu_hours };
            let index = format!("A{index}");
            gauges.with_label_values(&[entity, index.as_str()]).set(value);
        }
        registry.register(Box::new(gauges))?;
    }
    Ok(())
}

#[cfg(test)]
fn triple(e: f64, g: f64, w: f64) -> UsageTriple {
    UsageTriple { elapsed_hours: e, gpu_hours: g, weighted_gpu_hours: w }
}

// The value and index label of the sample for `entity` in `family`.

#[cfg(test)]
fn sample(text: &str, family: &str, entity: &str) -> Option<(f64, String)> {
    let line = text
        .lines()
        .find(|l| l.starts_with(&format!("{family}{{")) && l.contains(&format!("name_id=\"{entity}\"")))?;
    let (labels, value) = line.rsplit_once(' ')?;
    let index = labels.split("index=\"").nth(1)?.split('"').next()?;
    Some((value.parse().ok()?, index.to_string()))
}

#[cfg(test)]
fn render(daily: &Aggregates, cumulative: &Snapshots) -> String {
    let mut out = vec![];
    render_metrics(&mut out, daily, cumulative).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_metric_names() {
    assert!(metric_name(Window::Day, Scope::Partition, false) == "day_gpu_part_hours");
    assert!(metric_name(Window::Day, Scope::Group, true) == "day_gpu_tres_group_hours");
    assert!(metric_name(Window::Total, Scope::User, true) == "tot_gpu_tres_user_hours");
    assert!(metric_name(Window::Total, Scope::User, false) == "tot_gpu_user_hours");
}

#[test]
fn test_render_metrics() {
    let mut daily = Aggregates::default();
    daily.user.merge("alice", triple(1.0, 2.0, 1093.8));
    daily.group.merge("kempner_lab", triple(1.0, 2.0, 1093.8));
    daily.partition.merge("kempner", triple(1.0, 2.0, 1093.8));

    let mut old = Snapshots::default();
    old.user = crate::merge_snapshots(&old.user, &AggregateMap::from_iter([("bob", triple(24.0, 24.0, 5018.4))]))
        .unwrap();
    let cumulative = old.merge_all(&daily).unwrap();
    let text = render(&daily, &cumulative);

    assert!(text.lines().filter(|l| l.starts_with("# TYPE ") && l.ends_with(" gauge")).count() == 12);
    assert!(text.lines().filter(|l| l.starts_with("# HELP ")).count() == 12);
    assert!(text.contains("# HELP day_gpu_tres_user_hours Weighted GPU hours per user, over the last run\n"));
    assert!(sample(&text, "day_gpu_user_hours", "alice") == Some((2.0, "A2".to_string())));
    assert!(sample(&text, "day_gpu_tres_user_hours", "alice") == Some((1093.8, "A2".to_string())));
    assert!(sample(&text, "tot_gpu_user_hours", "bob") == Some((24.0, "A1".to_string())));
    assert!(sample(&text, "tot_gpu_tres_part_hours", "kempner") == Some((1093.8, "A1".to_string())));
    assert!(sample(&text, "day_gpu_user_hours", "bob").is_none());

    // One sample per entity per family: 2 day user/group/part, 4 tot user, 2 tot group/part
    let samples = text.lines().filter(|l| !l.starts_with('#')).count();
    assert!(samples == 14);
}

#[test]
fn test_daily_index_without_cumulative() {
    let mut daily = Aggregates::default();
    daily.group.merge("kempner_lab", triple(1.0, 1.0, 1.0));
    daily.group.merge("other_lab", triple(2.0, 2.0, 2.0));
    let text = render(&daily, &Snapshots::default());

    // Numbered as a merge would number them, heaviest first
    assert!(sample(&text, "day_gpu_group_hours", "other_lab") == Some((2.0, "A1".to_string())));
    assert!(sample(&text, "day_gpu_group_hours", "kempner_lab") == Some((1.0, "A2".to_string())));

    // Families without samples are left out
    assert!(text.lines().filter(|l| l.starts_with("# TYPE ")).count() == 2);
    assert!(!text.contains("tot_gpu_group_hours"));
}

#[test]
fn test_label_escaping() {
    let mut daily = Aggregates::default();
    daily.user.merge("a\"b", triple(1.0, 1.0, 1.0));
    let text = render(&daily, &Snapshots::default());
    assert!(text.contains("name_id=\"a\\\"b\""));
}

// Print the daily per-scope tables of a run, one table per scope.

use crate::format;
use crate::rollup::Rollup;
use anyhow::{bail, Result};
use sacctlog::{Scope, UsageTriple};
use std::collections::HashMap;
use std::io;

pub const DEFAULT_FMT: &str = "name,index,gpu-hours,gpu-tres-hours";

struct Row<'a> {
    name: &'a str,
    index: Option<u32>,
    usage: &'a UsageTriple,
}

type Formatters = HashMap<String, &'static dyn Fn(&Row) -> String>;

fn formatters() -> Formatters {
    let mut formatters: Formatters = HashMap::new();
    formatters.insert("name".to_string(), &format_name);
    formatters.insert("index".to_string(), &format_index);
    formatters.insert("gpu-hours".to_string(), &format_gpu_hours);
    formatters.insert("gpu-tres-hours".to_string(), &format_gpu_tres_hours);
    formatters.insert("elapsed-hours".to_string(), &format_elapsed_hours);
    formatters
}

/// Check a --fmt spec, returning the fields in order.

pub fn check_fmt(spec: &str) -> Result<Vec<&str>> {
    let (fields, others) = format::parse_fields::<Row, _>(spec, &formatters());
    if !others.is_empty() {
        let mut others = others.into_iter().collect::<Vec<&str>>();
        others.sort();
        bail!("Unknown field(s) in --fmt: {}", others.join(","));
    }
    if fields.is_empty() {
        bail!("No fields in --fmt");
    }
    Ok(fields)
}

pub fn print_tables(output: &mut dyn io::Write, rollup: &Rollup, spec: &str, csv: bool) -> Result<()> {
    let fields = check_fmt(spec)?;
    let formatters = formatters();
    for scope in Scope::ALL {
        let indices = rollup.cumulative.scope(scope);
        let rows = rollup
            .daily
            .scope(scope)
            .sorted()
            .into_iter()
            .map(|(name, usage)| Row {
                name,
                index: indices.index_of(name),
                usage,
            })
            .collect::<Vec<Row>>();
        writeln!(output, "# {}", scope.file_stem())?;
        format::format_data(output, &fields, &formatters, true, csv, &rows)?;
    }
    Ok(())
}

fn format_name(row: &Row) -> String {
    row.name.to_string()
}

fn format_index(row: &Row) -> String {
    match row.index {
        Some(n) => format!("A{n}"),
        None => "".to_string(),
    }
}

fn format_gpu_hours(row: &Row) -> String {
    format!("{:.1}", row.usage.gpu_hours)
}

fn format_gpu_tres_hours(row: &Row) -> String {
    format!("{:.1}", row.usage.weighted_gpu_hours)
}

fn format_elapsed_hours(row: &Row) -> String {
    format!("{:.1}", row.usage.elapsed_hours)
}

#[test]
fn test_check_fmt() {
    assert!(check_fmt(DEFAULT_FMT).unwrap() == vec!["name", "index", "gpu-hours", "gpu-tres-hours"]);
    assert!(check_fmt("elapsed-hours,name").unwrap().len() == 2);
    let err = check_fmt("name,cpu,mem").unwrap_err().to_string();
    assert!(err == "Unknown field(s) in --fmt: cpu,mem");
}

#[test]
fn test_print_tables() {
    use sacctlog::{RunStats, Snapshots};

    let mut rollup = Rollup {
        daily: Default::default(),
        cumulative: Snapshots::default(),
        stats: RunStats::default(),
        written: vec![],
    };
    rollup.daily.user.merge(
        "alice",
        UsageTriple { elapsed_hours: 1.0, gpu_hours: 2.0, weighted_gpu_hours: 1093.8 },
    );
    rollup.cumulative = rollup.cumulative.merge_all(&rollup.daily).unwrap();

    let mut out = vec![];
    print_tables(&mut out, &rollup, "name,index,gpu-tres-hours", true).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(
        text == "# partition\nname,index,gpu-tres-hours\n\
                 # group\nname,index,gpu-tres-hours\n\
                 # user\nname,index,gpu-tres-hours\nalice,A1,1093.8\n"
    );

    let mut out = vec![];
    print_tables(&mut out, &rollup, "name,gpu-hours", false).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.ends_with("# user\nname   gpu-hours\nalice  2.0\n"));
}

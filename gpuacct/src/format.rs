// Generic formatting code for a set of rows extracted from a data structure, presented in fixed-width
// columns or as csv, with or without a header.

use std::collections::{HashMap, HashSet};
use std::io;

/// Return a vector of the known fields in `spec` wrt the formatters, and a HashSet of any other
/// strings found in `spec`.

pub fn parse_fields<'a, DataT, FmtT>(
    spec: &'a str,
    formatters: &HashMap<String, FmtT>,
) -> (Vec<&'a str>, HashSet<&'a str>)
where
    FmtT: Fn(&DataT) -> String,
{
    let mut others = HashSet::new();
    let mut fields = vec![];
    for x in spec.split(',') {
        if formatters.contains_key(x) {
            fields.push(x);
        } else {
            others.insert(x);
        }
    }
    (fields, others)
}

/// Apply the formatters named by `fields` to each element of `data` and write the result.  Set
/// `header` to print a first row with the field names.  Set `csv` to get CSV output instead of
/// fixed-width columns.  Fields not in `formatters` print as empty.

pub fn format_data<DataT, FmtT>(
    output: &mut dyn io::Write,
    fields: &[&str],
    formatters: &HashMap<String, FmtT>,
    header: bool,
    csv: bool,
    data: &[DataT],
) -> io::Result<()>
where
    FmtT: Fn(&DataT) -> String,
{
    let rows = data
        .iter()
        .map(|x| {
            fields
                .iter()
                .map(|kwd| formatters.get(*kwd).map(|f| f(x)).unwrap_or_default())
                .collect::<Vec<String>>()
        })
        .collect::<Vec<Vec<String>>>();

    if csv {
        let mut writer = csv::Writer::from_writer(output);
        if header {
            writer.write_record(fields)?;
        }
        for row in &rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        return Ok(());
    }

    // The column width is the max across all the entries in the column, including the header if
    // present.
    let mut widths = fields
        .iter()
        .map(|kwd| if header { kwd.len() } else { 0 })
        .collect::<Vec<usize>>();
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = usize::max(*w, cell.len());
        }
    }

    if header {
        write_row(output, fields, &widths)?;
    }
    for row in &rows {
        write_row(output, row, &widths)?;
    }
    Ok(())
}

fn write_row<S: AsRef<str>>(output: &mut dyn io::Write, cells: &[S], widths: &[usize]) -> io::Result<()> {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, &w)| format!("{:w$}", cell.as_ref()))
        .collect::<Vec<String>>()
        .join("  ");
    writeln!(output, "{}", line.trim_end())
}

#[cfg(test)]
struct Item {
    name: &'static str,
    count: u32,
}

#[cfg(test)]
fn format_name(x: &Item) -> String {
    x.name.to_string()
}

#[cfg(test)]
fn format_count(x: &Item) -> String {
    x.count.to_string()
}

#[cfg(test)]
fn test_formatters() -> HashMap<String, &'static dyn Fn(&Item) -> String> {
    let mut formatters: HashMap<String, &'static dyn Fn(&Item) -> String> = HashMap::new();
    formatters.insert("name".to_string(), &format_name);
    formatters.insert("count".to_string(), &format_count);
    formatters
}

#[test]
fn test_parse_fields() {
    let formatters = test_formatters();
    let (fields, others) = parse_fields::<Item, _>("name,bogus,count", &formatters);
    assert!(fields == vec!["name", "count"]);
    assert!(others.len() == 1 && others.contains("bogus"));
}

#[test]
fn test_format_fixed() {
    let formatters = test_formatters();
    let data = [Item { name: "alice", count: 2 }, Item { name: "bo", count: 10 }];
    let mut out = vec![];
    format_data(&mut out, &["name", "count"], &formatters, true, false, &data).unwrap();
    assert!(String::from_utf8(out).unwrap() == "name   count\nalice  2\nbo     10\n");
}

#[test]
fn test_format_csv() {
    let formatters = test_formatters();
    let data = [Item { name: "a,b", count: 1 }];
    let mut out = vec![];
    format_data(&mut out, &["count", "name"], &formatters, true, true, &data).unwrap();
    assert!(String::from_utf8(out).unwrap() == "count,name\n1,\"a,b\"\n");
}

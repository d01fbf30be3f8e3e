// The dictionary files, and the cumulative snapshot they persist.
//
// FILE FORMAT
//
// One entity per line, sorted by descending weighted GPU hours:
//
//   name= alice , gpu_hours= 2.3, gpu_tres_hours= 1276.1, elapsed_hours= 1.2, index= 2
//
// Fields are comma-separated `key= value` pairs and whitespace around the separators is ignored.
// `name`, `gpu_hours` and `gpu_tres_hours` are required and always come first, so anything that
// reads only the first three fields still works.  `elapsed_hours` defaults to 0.  Older files have
// no `index`, and entries without one are numbered after the highest index in the file, in file
// order.  Unknown keys are ignored.  Values are written with one decimal.
//
// Names cannot contain ',' or whitespace; Slurm user, group and partition names don't.
//
// FILES
//
// For each scope there is a daily file `<scope>_dictionary.csv`, which is the run's aggregate map,
// and a cumulative file `<scope>_dictionary_sum.csv`, which is the running total.  All files are
// replaced atomically so a reader never sees a partial file.
//
// INDICES
//
// Every entity in a cumulative snapshot has an ordinal index, assigned when it first appears and
// never changed or given to anyone else.  Metrics use it as a label.  New entities get indices in
// output order, starting at one past the highest index the snapshot ever held.

use crate::aggregate::{AggregateMap, Aggregates};
use crate::usage::UsageTriple;
use crate::Scope;
use anyhow::{Context, Result};
use itertools::Itertools;
use log::warn;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("{file}:{line}: {message}")]
    BadLine {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{file}: `{name}` is listed more than once")]
    DuplicateName { file: String, name: String },

    #[error("{file}: index {index} is used by both `{first}` and `{second}`")]
    DuplicateIndex {
        file: String,
        index: u32,
        first: String,
        second: String,
    },

    #[error("No index left for `{name}`")]
    IndicesExhausted { name: String },

    #[error("Could not read {file}")]
    Io {
        file: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub name: String,
    pub index: u32,
    pub usage: UsageTriple,
}

/// Running totals with stable indices.

#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeSnapshot {
    entries: Vec<SnapshotEntry>,     // Ascending index
    positions: HashMap<String, usize>,
    next_index: u32,
}

impl Default for CumulativeSnapshot {
    fn default() -> CumulativeSnapshot {
        CumulativeSnapshot {
            entries: vec![],
            positions: HashMap::new(),
            next_index: 1,
        }
    }
}

impl CumulativeSnapshot {
    pub fn new() -> CumulativeSnapshot {
        CumulativeSnapshot::default()
    }

    /// Build a snapshot from entries that already have indices.  `label` names the source in
    /// errors.

    pub fn from_entries(
        mut entries: Vec<SnapshotEntry>,
        label: &str,
    ) -> Result<CumulativeSnapshot, SnapshotError> {
        entries.sort_by_key(|e| e.index);
        let mut positions = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            if i > 0 && entries[i - 1].index == entry.index {
                return Err(SnapshotError::DuplicateIndex {
                    file: label.to_string(),
                    index: entry.index,
                    first: entries[i - 1].name.clone(),
                    second: entry.name.clone(),
                });
            }
            if positions.insert(entry.name.clone(), i).is_some() {
                return Err(SnapshotError::DuplicateName {
                    file: label.to_string(),
                    name: entry.name.clone(),
                });
            }
        }
        let next_index = match entries.last() {
            Some(e) => e.index.checked_add(1).ok_or_else(|| SnapshotError::IndicesExhausted {
                name: e.name.clone(),
            })?,
            None => 1,
        };
        Ok(CumulativeSnapshot {
            entries,
            positions,
            next_index,
        })
    }

    pub fn get(&self, name: &str) -> Option<&SnapshotEntry> {
        self.positions.get(name).map(|&i| &self.entries[i])
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.get(name).map(|e| e.index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The index the next new entity will get.

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Entries in index order.

    pub fn iter(&self) -> std::slice::Iter<'_, SnapshotEntry> {
        self.entries.iter()
    }

    /// Entries in output order: descending weighted GPU hours, then ascending name.

    pub fn sorted(&self) -> Vec<&SnapshotEntry> {
        self.entries
            .iter()
            .sorted_by(|a, b| {
                b.usage
                    .weighted_gpu_hours
                    .total_cmp(&a.usage.weighted_gpu_hours)
                    .then_with(|| a.name.cmp(&b.name))
            })
            .collect()
    }

    /// The totals without the indices.

    pub fn usage(&self) -> AggregateMap {
        self.entries.iter().map(|e| (e.name.as_str(), e.usage)).collect()
    }

    fn add(&mut self, name: &str, usage: UsageTriple) -> Result<(), SnapshotError> {
        if let Some(&i) = self.positions.get(name) {
            self.entries[i].usage += usage;
            return Ok(());
        }
        let index = self.next_index;
        self.next_index = index.checked_add(1).ok_or_else(|| SnapshotError::IndicesExhausted {
            name: name.to_string(),
        })?;
        self.positions.insert(name.to_string(), self.entries.len());
        self.entries.push(SnapshotEntry {
            name: name.to_string(),
            index,
            usage,
        });
        Ok(())
    }
}

/// Fold a new aggregate into a snapshot.  Known entities keep their index, new ones are numbered
/// in output order.  Fails only if the index space runs out.

pub fn merge_snapshots(old: &CumulativeSnapshot, new: &AggregateMap) -> Result<CumulativeSnapshot, SnapshotError> {
    let mut merged = old.clone();
    for (name, usage) in new.sorted() {
        merged.add(name, *usage)?;
    }
    Ok(merged)
}

/// The cumulative snapshots of all scopes.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshots {
    pub partition: CumulativeSnapshot,
    pub group: CumulativeSnapshot,
    pub user: CumulativeSnapshot,
}

impl Snapshots {
    pub fn scope(&self, scope: Scope) -> &CumulativeSnapshot {
        match scope {
            Scope::Partition => &self.partition,
            Scope::Group => &self.group,
            Scope::User => &self.user,
        }
    }

    pub fn scope_mut(&mut self, scope: Scope) -> &mut CumulativeSnapshot {
        match scope {
            Scope::Partition => &mut self.partition,
            Scope::Group => &mut self.group,
            Scope::User => &mut self.user,
        }
    }

    pub fn merge_all(&self, daily: &Aggregates) -> Result<Snapshots, SnapshotError> {
        let mut merged = Snapshots::default();
        for scope in Scope::ALL {
            *merged.scope_mut(scope) = merge_snapshots(self.scope(scope), daily.scope(scope))?;
        }
        Ok(merged)
    }

    /// Load the cumulative files of all scopes from `dir`.  Missing files are empty snapshots.

    pub fn load(dir: &Path) -> Result<Snapshots, SnapshotError> {
        let mut snapshots = Snapshots::default();
        for scope in Scope::ALL {
            *snapshots.scope_mut(scope) = load_snapshot(&cumulative_path(dir, scope))?;
        }
        Ok(snapshots)
    }

    /// Replace the cumulative files of all scopes in `dir`, returning the paths written.

    pub fn store(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut written = vec![];
        for scope in Scope::ALL {
            let path = cumulative_path(dir, scope);
            store_snapshot(&path, self.scope(scope))?;
            written.push(path);
        }
        Ok(written)
    }
}

pub fn daily_path(dir: &Path, scope: Scope) -> PathBuf {
    dir.join(format!("{}_dictionary.csv", scope.file_stem()))
}

pub fn cumulative_path(dir: &Path, scope: Scope) -> PathBuf {
    dir.join(format!("{}_dictionary_sum.csv", scope.file_stem()))
}

fn write_line(out: &mut dyn Write, name: &str, usage: &UsageTriple, index: Option<u32>) -> io::Result<()> {
    write!(
        out,
        "name= {} , gpu_hours= {:.1}, gpu_tres_hours= {:.1}, elapsed_hours= {:.1}",
        name, usage.gpu_hours, usage.weighted_gpu_hours, usage.elapsed_hours
    )?;
    if let Some(index) = index {
        write!(out, ", index= {index}")?;
    }
    writeln!(out, " ")
}

/// Write an aggregate map in output order.  If `indices` is given, entities it knows are written
/// with their index.

pub fn write_aggregate(
    out: &mut dyn Write,
    map: &AggregateMap,
    indices: Option<&CumulativeSnapshot>,
) -> io::Result<()> {
    for (name, usage) in map.sorted() {
        write_line(out, name, usage, indices.and_then(|s| s.index_of(name)))?;
    }
    Ok(())
}

pub fn write_snapshot(out: &mut dyn Write, snapshot: &CumulativeSnapshot) -> io::Result<()> {
    for entry in snapshot.sorted() {
        write_line(out, &entry.name, &entry.usage, Some(entry.index))?;
    }
    Ok(())
}

/// Parse a dictionary file.  `label` names the input in errors, normally the file name.

pub fn read_snapshot<R: BufRead>(input: R, label: &str) -> Result<CumulativeSnapshot, SnapshotError> {
    let mut indexed = vec![];
    let mut unindexed = vec![];
    for (lineno, line) in input.lines().enumerate() {
        let line = line.map_err(|source| SnapshotError::Io {
            file: label.to_string(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let (name, usage, index) = parse_snapshot_line(&line).map_err(|message| SnapshotError::BadLine {
            file: label.to_string(),
            line: lineno + 1,
            message,
        })?;
        match index {
            Some(index) => indexed.push(SnapshotEntry { name, index, usage }),
            None => unindexed.push((name, usage)),
        }
    }

    if !unindexed.is_empty() {
        warn!("{label}: {} entries without index, numbering them", unindexed.len());
    }
    let mut next = indexed.iter().map(|e| e.index).max().unwrap_or(0);
    for (name, usage) in unindexed {
        next = match next.checked_add(1) {
            Some(n) if n < u32::MAX => n,
            _ => return Err(SnapshotError::IndicesExhausted { name }),
        };
        indexed.push(SnapshotEntry { name, index: next, usage });
    }
    CumulativeSnapshot::from_entries(indexed, label)
}

fn parse_snapshot_line(line: &str) -> std::result::Result<(String, UsageTriple, Option<u32>), String> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for part in line.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| format!("expected key= value, found `{}`", part.trim()))?;
        let key = key.trim();
        if fields.insert(key, value.trim()).is_some() {
            return Err(format!("`{key}` given twice"));
        }
    }

    let name = match fields.get("name") {
        Some(name) if !name.is_empty() && !name.contains(char::is_whitespace) => name.to_string(),
        Some(name) => return Err(format!("bad name `{name}`")),
        None => return Err("no name".to_string()),
    };
    let gpu_hours = hours_field(&fields, "gpu_hours")?.ok_or("no gpu_hours")?;
    let weighted_gpu_hours = hours_field(&fields, "gpu_tres_hours")?.ok_or("no gpu_tres_hours")?;
    let elapsed_hours = hours_field(&fields, "elapsed_hours")?.unwrap_or(0.0);
    let index = match fields.get("index") {
        Some(v) => match u32::from_str(v) {
            Ok(n) if n > 0 && n < u32::MAX => Some(n),
            _ => return Err(format!("bad index `{v}`")),
        },
        None => None,
    };
    Ok((
        name,
        UsageTriple {
            elapsed_hours,
            gpu_hours,
            weighted_gpu_hours,
        },
        index,
    ))
}

fn hours_field(fields: &HashMap<&str, &str>, key: &str) -> std::result::Result<Option<f64>, String> {
    match fields.get(key) {
        None => Ok(None),
        Some(v) => match f64::from_str(v) {
            Ok(x) if x.is_finite() && x >= 0.0 => Ok(Some(x)),
            _ => Err(format!("bad {key} `{v}`")),
        },
    }
}

/// Load a dictionary file, a missing file is an empty snapshot.

pub fn load_snapshot(path: &Path) -> Result<CumulativeSnapshot, SnapshotError> {
    let label = path.display().to_string();
    match File::open(path) {
        Ok(file) => read_snapshot(BufReader::new(file), &label),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(CumulativeSnapshot::new()),
        Err(source) => Err(SnapshotError::Io { file: label, source }),
    }
}

pub fn store_snapshot(path: &Path, snapshot: &CumulativeSnapshot) -> Result<()> {
    replace_file(path, |out| write_snapshot(out, snapshot))
}

pub fn store_aggregate(path: &Path, map: &AggregateMap, indices: Option<&CumulativeSnapshot>) -> Result<()> {
    replace_file(path, |out| write_aggregate(out, map, indices))
}

/// Write a file by writing a temporary file next to it and renaming it into place, so that
/// readers see either the old or the new contents.

pub fn replace_file<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Creating temporary file in {}", dir.display()))?;
    {
        let mut out = BufWriter::new(tmp.as_file_mut());
        write(&mut out).and_then(|_| out.flush())
            .with_context(|| format!("Writing {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .with_context(|| format!("Setting permissions for {}", path.display()))?;
    }
    tmp.persist(path)
        .with_context(|| format!("Replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
fn triple(e: f64, g: f64, w: f64) -> UsageTriple {
    UsageTriple { elapsed_hours: e, gpu_hours: g, weighted_gpu_hours: w }
}

#[cfg(test)]
fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

#[test]
fn test_merge_indices() {
    let day1 = AggregateMap::from_iter([
        ("alice", triple(1.2, 2.3, 1276.1)),
        ("bob", triple(24.0, 24.0, 5018.4)),
        ("carol", triple(0.5, 2.0, 418.2)),
    ]);
    let s1 = merge_snapshots(&CumulativeSnapshot::new(), &day1).unwrap();
    assert!(s1.index_of("bob") == Some(1));
    assert!(s1.index_of("alice") == Some(2));
    assert!(s1.index_of("carol") == Some(3));
    assert!(s1.next_index() == 4);

    // grace is new and outweighs everyone, but still gets the next index
    let day2 = AggregateMap::from_iter([("alice", triple(2.0, 2.0, 1093.8)), ("grace", triple(1.0, 2.0, 9000.0))]);
    let s2 = merge_snapshots(&s1, &day2).unwrap();
    assert!(s2.index_of("bob") == Some(1));
    assert!(s2.index_of("alice") == Some(2));
    assert!(s2.index_of("carol") == Some(3));
    assert!(s2.index_of("grace") == Some(4));
    assert!(close(s2.get("alice").unwrap().usage.weighted_gpu_hours, 1276.1 + 1093.8));
    assert!(s2.sorted()[0].name == "grace");

    // Merging with nothing changes nothing
    assert!(merge_snapshots(&s2, &AggregateMap::new()).unwrap() == s2);
}

#[test]
fn test_merge_associative() {
    let s = read_snapshot("name= a , gpu_hours= 1.0, gpu_tres_hours= 10.0, index= 7\n".as_bytes(), "s").unwrap();
    let a = AggregateMap::from_iter([("a", triple(1.0, 1.0, 1.0)), ("b", triple(2.0, 2.0, 2.0))]);
    let b = AggregateMap::from_iter([("b", triple(1.0, 3.0, 5.0)), ("c", triple(4.0, 4.0, 4.0))]);

    let left = merge_snapshots(&merge_snapshots(&s, &a).unwrap(), &b).unwrap();
    let mut ab = a.clone();
    ab.merge_map(&b);
    let right = merge_snapshots(&s, &ab).unwrap();

    assert!(left.len() == right.len());
    for entry in left.iter() {
        let other = right.get(&entry.name).unwrap();
        assert!(close(entry.usage.gpu_hours, other.usage.gpu_hours));
        assert!(close(entry.usage.weighted_gpu_hours, other.usage.weighted_gpu_hours));
        assert!(close(entry.usage.elapsed_hours, other.usage.elapsed_hours));
    }
    assert!(left.index_of("a") == Some(7) && right.index_of("a") == Some(7));
}

#[test]
fn test_indices_not_reused() {
    // Gap at 2 and 3 stays a gap
    let text = "name= x , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 1\n\
                name= y , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 4\n";
    let s = read_snapshot(text.as_bytes(), "s").unwrap();
    let merged = merge_snapshots(&s, &AggregateMap::from_iter([("z", triple(0.0, 0.0, 0.0))])).unwrap();
    assert!(merged.index_of("z") == Some(5));
    let indices = merged.iter().map(|e| e.index).collect::<Vec<u32>>();
    assert!(indices == vec![1, 4, 5]);
}

#[test]
fn test_index_space_exhausted() {
    let bad = |text: &str| read_snapshot(text.as_bytes(), "t").unwrap_err().to_string();
    let top = "name= a , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 4294967295\n";
    assert!(bad(top).contains("t:1: bad index"));
    assert!(bad(&format!("{top}name= b , gpu_hours= 1.0, gpu_tres_hours= 1.0\n")).contains("t:1: bad index"));

    // The last index there is, then a legacy line that would need one more
    let last = "name= a , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 4294967294\n";
    let s = read_snapshot(last.as_bytes(), "t").unwrap();
    assert!(s.next_index() == u32::MAX);
    let err = bad(&format!("{last}name= b , gpu_hours= 1.0, gpu_tres_hours= 1.0\n"));
    assert!(err == "No index left for `b`");

    // Known names still merge, a new one does not
    let merged = merge_snapshots(&s, &AggregateMap::from_iter([("a", triple(1.0, 1.0, 1.0))])).unwrap();
    assert!(close(merged.get("a").unwrap().usage.gpu_hours, 2.0));
    assert!(matches!(
        merge_snapshots(&s, &AggregateMap::from_iter([("b", triple(1.0, 1.0, 1.0))])),
        Err(SnapshotError::IndicesExhausted { .. })
    ));
}

#[test]
fn test_read_legacy() {
    let file = File::open("../sacct_test_data/legacy_user_sum.csv").unwrap();
    let s = read_snapshot(BufReader::new(file), "legacy_user_sum.csv").unwrap();
    assert!(s.len() == 3);
    assert!(s.index_of("bob") == Some(1));
    assert!(s.index_of("alice") == Some(2));
    assert!(s.index_of("carol") == Some(3));
    assert!(close(s.get("bob").unwrap().usage.weighted_gpu_hours, 5018.4));
    assert!(s.get("bob").unwrap().usage.elapsed_hours == 0.0);
}

#[test]
fn test_read_mixed_indices() {
    let text = "name= new1 , gpu_hours= 1.0, gpu_tres_hours= 1.0\n\
                \n\
                name= old , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 3, color= blue\n\
                name=new2,gpu_hours=1.0,gpu_tres_hours=1.0\n";
    let s = read_snapshot(text.as_bytes(), "s").unwrap();
    assert!(s.index_of("old") == Some(3));
    assert!(s.index_of("new1") == Some(4));
    assert!(s.index_of("new2") == Some(5));
}

#[test]
fn test_read_errors() {
    let bad = |text: &str| read_snapshot(text.as_bytes(), "t").unwrap_err().to_string();

    assert!(bad("name= a , gpu_hours= 1.0\n").contains("t:1: no gpu_tres_hours"));
    assert!(bad("\nname= a , gpu_hours= -1.0, gpu_tres_hours= 1.0\n").contains("t:2: bad gpu_hours"));
    assert!(bad("name= a , gpu_hours= NaN, gpu_tres_hours= 1.0\n").contains("bad gpu_hours"));
    assert!(bad("gpu_hours= 1.0, gpu_tres_hours= 1.0\n").contains("no name"));
    assert!(bad("name= a , gpu_hours= 1.0, gpu_tres_hours= 1.0, gpu_hours= 2.0\n").contains("given twice"));
    assert!(bad("name= a b , gpu_hours= 1.0, gpu_tres_hours= 1.0\n").contains("bad name"));
    assert!(bad("name= a , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 0\n").contains("bad index"));
    assert!(bad("garbage\n").contains("expected key= value"));

    let dup = "name= a , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 1\n\
               name= a , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 2\n";
    assert!(matches!(read_snapshot(dup.as_bytes(), "t"), Err(SnapshotError::DuplicateName { .. })));
    let dup = "name= a , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 1\n\
               name= b , gpu_hours= 1.0, gpu_tres_hours= 1.0, index= 1\n";
    assert!(matches!(read_snapshot(dup.as_bytes(), "t"), Err(SnapshotError::DuplicateIndex { .. })));

    let file = File::open("../sacct_test_data/bad_snapshot.csv").unwrap();
    assert!(matches!(
        read_snapshot(BufReader::new(file), "bad_snapshot.csv"),
        Err(SnapshotError::BadLine { line: 2, .. })
    ));
}

#[test]
fn test_write_format() {
    let map = AggregateMap::from_iter([("alice", triple(7.0 / 6.0, 7.0 / 3.0, 1276.1))]);
    let mut out = vec![];
    write_aggregate(&mut out, &map, None).unwrap();
    assert!(
        String::from_utf8(out).unwrap()
            == "name= alice , gpu_hours= 2.3, gpu_tres_hours= 1276.1, elapsed_hours= 1.2 \n"
    );

    let snap = merge_snapshots(&CumulativeSnapshot::new(), &map).unwrap();
    let mut out = vec![];
    write_snapshot(&mut out, &snap).unwrap();
    assert!(
        String::from_utf8(out).unwrap()
            == "name= alice , gpu_hours= 2.3, gpu_tres_hours= 1276.1, elapsed_hours= 1.2, index= 1 \n"
    );
}

#[test]
fn test_round_trip() {
    let map = AggregateMap::from_iter([
        ("bob", triple(24.0, 24.0, 5018.4)),
        ("alice", triple(7.0 / 6.0, 7.0 / 3.0, 1276.1)),
        ("carol", triple(0.5, 2.0, 418.2)),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let path = daily_path(dir.path(), Scope::User);
    store_aggregate(&path, &map, None).unwrap();
    let back = load_snapshot(&path).unwrap().usage();
    assert!(back.len() == map.len());
    for (name, usage) in map.iter() {
        let u = back.get(name).unwrap();
        assert!((u.gpu_hours - usage.gpu_hours).abs() <= 0.05);
        assert!((u.weighted_gpu_hours - usage.weighted_gpu_hours).abs() <= 0.05);
        assert!((u.elapsed_hours - usage.elapsed_hours).abs() <= 0.05);
    }
}

#[test]
fn test_load_store() {
    let dir = tempfile::tempdir().unwrap();
    let empty = Snapshots::load(dir.path()).unwrap();
    assert!(Scope::ALL.iter().all(|s| empty.scope(*s).is_empty()));

    let mut daily = Aggregates::default();
    daily.user.merge("alice", triple(1.0, 2.0, 1093.8));
    daily.group.merge("kempner_lab", triple(1.0, 2.0, 1093.8));
    let merged = empty.merge_all(&daily).unwrap();
    let written = merged.store(dir.path()).unwrap();
    assert!(written.len() == 3);
    assert!(written[2].ends_with("user_dictionary_sum.csv"));

    let loaded = Snapshots::load(dir.path()).unwrap();
    assert!(loaded.user.index_of("alice") == Some(1));
    assert!(loaded.group.len() == 1);
    assert!(loaded.partition.is_empty());

    // Replacing an existing file
    let again = loaded.merge_all(&daily).unwrap();
    again.store(dir.path()).unwrap();
    let loaded = Snapshots::load(dir.path()).unwrap();
    assert!(close(loaded.user.get("alice").unwrap().usage.gpu_hours, 4.0));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(cumulative_path(dir.path(), Scope::User)).unwrap().permissions().mode();
        assert!(mode & 0o777 == 0o644);
    }
}

// Read run settings from a json file.
//
// The file is a single object, every field optional:
//
//   gpu_weights - object, GPU class name -> positive weight.  Classes named here override the
//                 built-in weights (h100 546.9, a100 209.1) or are added after them
//   pool_label - string, substring marking partitions and groups of the reserved pool [kempner]
//   fallback_label - string, partition key for foreign jobs on pool nodes [non-kempner]
//   group_filter - string, keep only groups containing this in the group scope, "" for all
//                  [kempner]
//   node_partition - string, the partition whose nodes make up the pool [kempner_requeue]
//   node_command - array of strings, command printing the pool nodes, overrides node_partition
//                  [sinfo --noheader -N -p <node_partition> -o %N]
//
// See ../../sacct_test_data/settings.json for an example.

use anyhow::{bail, Context, Result};
use sacctlog::{CommandNodes, GpuWeights, DEFAULT_FALLBACK_LABEL, DEFAULT_POOL_LABEL};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub const DEFAULT_NODE_PARTITION: &str = "kempner_requeue";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    gpu_weights: Option<BTreeMap<String, f64>>,
    pool_label: Option<String>,
    fallback_label: Option<String>,
    group_filter: Option<String>,
    node_partition: Option<String>,
    node_command: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub weights: GpuWeights,
    pub pool_label: String,
    pub fallback_label: String,

    /// None if the group scope keeps every group.
    pub group_filter: Option<String>,

    pub node_command: Vec<String>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            weights: GpuWeights::default(),
            pool_label: DEFAULT_POOL_LABEL.to_string(),
            fallback_label: DEFAULT_FALLBACK_LABEL.to_string(),
            group_filter: Some(DEFAULT_POOL_LABEL.to_string()),
            node_command: CommandNodes::sinfo(DEFAULT_NODE_PARTITION).argv().to_vec(),
        }
    }
}

pub fn read_from_json(filename: &str) -> Result<Settings> {
    let file = File::open(Path::new(filename)).with_context(|| format!("Opening {filename}"))?;
    read_from_reader(BufReader::new(file)).with_context(|| format!("Settings file {filename}"))
}

pub fn read_from_reader<R: Read>(reader: R) -> Result<Settings> {
    let file: SettingsFile = serde_json::from_reader(reader)?;
    let mut settings = Settings::default();

    if let Some(overrides) = file.gpu_weights {
        let mut classes = settings.weights.iter().map(|(c, w)| (c.to_string(), w)).collect::<Vec<_>>();
        for (class, weight) in overrides {
            let class = class.trim().to_lowercase();
            match classes.iter_mut().find(|(c, _)| *c == class) {
                Some(entry) => entry.1 = weight,
                None => classes.push((class, weight)),
            }
        }
        settings.weights = GpuWeights::new(classes)?;
    }
    if let Some(label) = file.pool_label {
        if label.is_empty() {
            bail!("Field 'pool_label' must not be empty");
        }
        settings.pool_label = label;
    }
    if let Some(label) = file.fallback_label {
        if label.is_empty() {
            bail!("Field 'fallback_label' must not be empty");
        }
        settings.fallback_label = label;
    }
    if let Some(filter) = file.group_filter {
        settings.group_filter = if filter.is_empty() { None } else { Some(filter) };
    }
    if let Some(partition) = file.node_partition {
        if partition.is_empty() {
            bail!("Field 'node_partition' must not be empty");
        }
        settings.node_command = CommandNodes::sinfo(&partition).argv().to_vec();
    }
    if let Some(command) = file.node_command {
        if command.is_empty() || command[0].is_empty() {
            bail!("Field 'node_command' must be a nonempty array");
        }
        settings.node_command = command;
    }
    Ok(settings)
}

#[test]
fn test_defaults() {
    let s = read_from_reader("{}".as_bytes()).unwrap();
    assert!(s.weights == GpuWeights::default());
    assert!(s.pool_label == "kempner");
    assert!(s.fallback_label == "non-kempner");
    assert!(s.group_filter.as_deref() == Some("kempner"));
    assert!(s.node_command.join(" ") == "sinfo --noheader -N -p kempner_requeue -o %N");
}

#[test]
fn test_override_one_weight() {
    let s = read_from_reader(r#"{ "gpu_weights": { "A100": 250.0, "v100": 60.0 } }"#.as_bytes()).unwrap();
    let classes = s.weights.iter().collect::<Vec<(&str, f64)>>();
    assert!(classes == vec![("h100", 546.9), ("a100", 250.0), ("v100", 60.0)]);
}

#[test]
fn test_read_from_json() {
    let s = read_from_json("../sacct_test_data/settings.json").unwrap();
    assert!(s.weights.lookup("nvidia_h200").is_some());
    assert!(s.group_filter.is_none());
    assert!(s.node_command == vec!["cat".to_string(), "../sacct_test_data/nodes.txt".to_string()]);
}

#[test]
fn test_partition_and_command() {
    let s = read_from_reader(r#"{ "node_partition": "pool_a" }"#.as_bytes()).unwrap();
    assert!(s.node_command[4] == "pool_a");
    let s = read_from_reader(r#"{ "node_partition": "pool_a", "node_command": ["echo", "n1"] }"#.as_bytes()).unwrap();
    assert!(s.node_command == vec!["echo".to_string(), "n1".to_string()]);
}

#[test]
fn test_bad_settings() {
    assert!(read_from_reader(r#"{ "gpu_weights": { "a100": -1.0 } }"#.as_bytes()).is_err());
    assert!(read_from_reader(r#"{ "gpu_weights": { "": 1.0 } }"#.as_bytes()).is_err());
    assert!(read_from_reader(r#"{ "pool_label": "" }"#.as_bytes()).is_err());
    assert!(read_from_reader(r#"{ "node_command": [] }"#.as_bytes()).is_err());
    assert!(read_from_reader(r#"{ "gpu_weight": {} }"#.as_bytes()).is_err());
    assert!(read_from_reader(r#"[]"#.as_bytes()).is_err());
    assert!(read_from_json("../sacct_test_data/no-such-settings.json").is_err());
}

// Sources for the set of nodes in the reserved pool.
//
// On the cluster the set comes from running `sinfo` against the pool's partition.  Tests, and
// sites without direct scheduler access, can read the list from a file or supply it directly.
//
// The node list format is one entry per line, where an entry is the first whitespace-separated
// column and may be a hostlist expression.  Blank lines, `#` comments and a `NODELIST` header line
// are ignored.

use crate::hostlist::expand_hostlist;
use log::warn;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Node command is empty")]
    EmptyCommand,

    #[error("Could not run `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` failed with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Could not read node list {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Bad node list entry `{entry}`: {message}")]
    Hostlist { entry: String, message: String },
}

/// Something that knows the reserved-pool nodes.

pub trait NodeSource {
    fn fetch_reserved_nodes(&self) -> Result<HashSet<String>, LookupError>;
}

/// Run a command and take the node list from its stdout.

#[derive(Debug, Clone)]
pub struct CommandNodes {
    argv: Vec<String>,
}

impl CommandNodes {
    pub fn new(argv: Vec<String>) -> CommandNodes {
        CommandNodes { argv }
    }

    /// `sinfo --noheader -N -p <partition> -o %N`, one node name per line.

    pub fn sinfo(partition: &str) -> CommandNodes {
        CommandNodes::new(
            ["sinfo", "--noheader", "-N", "-p", partition, "-o", "%N"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl NodeSource for CommandNodes {
    fn fetch_reserved_nodes(&self) -> Result<HashSet<String>, LookupError> {
        let (program, args) = self.argv.split_first().ok_or(LookupError::EmptyCommand)?;
        let command = self.argv.join(" ");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| LookupError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(LookupError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_node_list(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Read the node list from a file.

#[derive(Debug, Clone)]
pub struct FileNodes {
    path: PathBuf,
}

impl FileNodes {
    pub fn new(path: impl Into<PathBuf>) -> FileNodes {
        FileNodes { path: path.into() }
    }
}

impl NodeSource for FileNodes {
    fn fetch_reserved_nodes(&self) -> Result<HashSet<String>, LookupError> {
        let text = fs::read_to_string(&self.path).map_err(|source| LookupError::Read {
            path: self.path.clone(),
            source,
        })?;
        parse_node_list(&text)
    }
}

/// A fixed set.

#[derive(Debug, Clone, Default)]
pub struct StaticNodes {
    nodes: HashSet<String>,
}

impl StaticNodes {
    pub fn new<I, S>(nodes: I) -> StaticNodes
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StaticNodes {
            nodes: nodes.into_iter().map(|s| s.into()).collect(),
        }
    }
}

impl NodeSource for StaticNodes {
    fn fetch_reserved_nodes(&self) -> Result<HashSet<String>, LookupError> {
        Ok(self.nodes.clone())
    }
}

pub fn parse_node_list(text: &str) -> Result<HashSet<String>, LookupError> {
    let mut nodes = HashSet::new();
    for line in text.lines() {
        let entry = match line.split_whitespace().next() {
            Some(entry) => entry,
            None => continue,
        };
        if entry.starts_with('#') || entry == "NODELIST" {
            continue;
        }
        let names = expand_hostlist(entry).map_err(|e| LookupError::Hostlist {
            entry: entry.to_string(),
            message: e.to_string(),
        })?;
        nodes.extend(names);
    }
    Ok(nodes)
}

/// Fetch the node set, degrading to the empty set on failure.  With no nodes nothing is
/// reclassified, which changes the partition totals, so the failure is logged as a warning.

pub fn reserved_nodes_or_empty(source: &dyn NodeSource) -> HashSet<String> {
    match source.fetch_reserved_nodes() {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!("Reserved-pool node lookup failed, no partitions will be reclassified: {e:#}");
            HashSet::new()
        }
    }
}

#[test]
fn test_parse_node_list() {
    let nodes = parse_node_list(
        "NODELIST\n# pool nodes\n\nholygpu8a[101-103] idle\n  holygpu8a11201\nholygpu8a101\n",
    )
    .unwrap();
    assert!(nodes.len() == 4);
    assert!(nodes.contains("holygpu8a101"));
    assert!(nodes.contains("holygpu8a103"));
    assert!(nodes.contains("holygpu8a11201"));

    assert!(matches!(parse_node_list("c[1-\n"), Err(LookupError::Hostlist { .. })));
}

#[test]
fn test_file_nodes() {
    let nodes = FileNodes::new("../sacct_test_data/nodes.txt").fetch_reserved_nodes().unwrap();
    assert!(nodes.len() == 3);
    assert!(nodes.contains("holygpu8a11101"));
    assert!(nodes.contains("holygpu8a11102"));
    assert!(nodes.contains("holygpu8a11201"));

    let missing = FileNodes::new("../sacct_test_data/no-such-file.txt");
    assert!(matches!(missing.fetch_reserved_nodes(), Err(LookupError::Read { .. })));
    assert!(reserved_nodes_or_empty(&missing).is_empty());
}

#[test]
fn test_command_nodes() {
    let echo = CommandNodes::new(vec!["echo".to_string(), "holygpu8a[11101-11102]".to_string()]);
    let nodes = echo.fetch_reserved_nodes().unwrap();
    assert!(nodes.len() == 2);
    assert!(nodes.contains("holygpu8a11102"));

    let failing = CommandNodes::new(vec!["false".to_string()]);
    assert!(matches!(failing.fetch_reserved_nodes(), Err(LookupError::Failed { .. })));
    assert!(reserved_nodes_or_empty(&failing).is_empty());

    let absent = CommandNodes::new(vec!["no-such-command-for-gpuacct".to_string()]);
    assert!(matches!(absent.fetch_reserved_nodes(), Err(LookupError::Spawn { .. })));

    let empty = CommandNodes::new(vec![]);
    assert!(matches!(empty.fetch_reserved_nodes(), Err(LookupError::EmptyCommand)));

    assert!(CommandNodes::sinfo("kempner_requeue").argv()[4] == "kempner_requeue");
}

#[test]
fn test_static_nodes() {
    let nodes = StaticNodes::new(["a", "b"]).fetch_reserved_nodes().unwrap();
    assert!(nodes.len() == 2);
}

// This library reads Slurm accounting records (`sacct --parsable2` style output, one finished job per
// line) and rolls them up into per-user, per-group and per-partition GPU-hour totals, weighted by
// GPU class.  It also reads and writes the plain-text dictionary files that carry the running
// totals from one run to the next, and renders the totals as gauge metrics.
//
// The flow through the library is:
//
//   record::read_accounting -> usage::compute_usage -> pool::ReservedPool::classify
//     -> aggregate::Aggregator -> snapshot::merge_snapshots -> metrics::render_metrics
//
// Everything is single-threaded and synchronous.  Dictionary files are replaced atomically, but
// there is no locking: two runs against the same output directory must not overlap.

mod aggregate;
mod elapsed;
mod hostlist;
mod metrics;
mod nodes;
mod pool;
mod record;
mod snapshot;
mod tres;
mod usage;
mod weights;

// Fold a stream of accounting records into the three per-scope maps, counting what was left out.

pub use aggregate::{aggregate_accounting, aggregate_file, AggregateMap, Aggregates, Aggregator};
pub use aggregate::{ExcludedVolume, RunStats};

// Elapsed-time fields to fractional hours.

pub use elapsed::{elapsed_hours, ElapsedError};

// Hostlist expressions, `holygpu8a[11101-11104]` and friends.

pub use hostlist::expand_hostlist;

// Prometheus text exposition of the daily and cumulative totals.

pub use metrics::{metric_name, metrics_registry, render_metrics, Window};

// Where the reserved-pool node set comes from.

pub use nodes::{parse_node_list, reserved_nodes_or_empty};
pub use nodes::{CommandNodes, FileNodes, LookupError, NodeSource, StaticNodes};

// Partition reclassification against the reserved pool.

pub use pool::{ReservedPool, DEFAULT_FALLBACK_LABEL, DEFAULT_POOL_LABEL};

// Turn accounting lines into job records.

pub use record::{parse_line, read_accounting, Skip, FIELD_DELIMITER, MIN_FIELDS};

// The dictionary file format and the cumulative rollup.

pub use snapshot::{cumulative_path, daily_path, load_snapshot, merge_snapshots, read_snapshot};
pub use snapshot::{replace_file, store_aggregate, store_snapshot, write_aggregate, write_snapshot};
pub use snapshot::{CumulativeSnapshot, SnapshotEntry, SnapshotError, Snapshots};

// The TRES mini-language of the AllocTRES column.

pub use tres::{gpu_classes, gpu_count, parse_tres, parse_tres_lenient, TresError, TresToken};

// Per-job usage figures.

pub use usage::{compute_usage, Billing, UsageTriple};

// GPU class weights.

pub use weights::{GpuWeights, WeightError, DEFAULT_GPU_WEIGHTS};

/// One finished job, as extracted from one accounting line.  Nothing has been interpreted yet: the
/// elapsed time and the resource spec are the raw column text.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    /// Login name of the job owner.  Never empty.
    pub user_id: String,

    /// First entry of the group (account) column.  Never empty.
    pub group_id: String,

    /// First entry of the partition column, a job can be submitted to several.  Never empty.
    pub partition_id: String,

    /// `[D-]HH:MM:SS`
    pub elapsed_wall: String,

    /// The AllocTRES list, eg `cpu=8,gres/gpu:nvidia_h100_80gb_hbm3=2,gres/gpu=2,mem=64G`.
    pub resource_spec: String,

    /// The node list column, verbatim.  For multi-node jobs this is a hostlist expression.
    pub node_name: String,
}

/// The three accounting scopes.  Each run produces one map per scope, and each scope has its own
/// pair of dictionary files and its own metric families.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Partition,
    Group,
    User,
}

impl Scope {
    /// Output order of tables and dictionary files.

    pub const ALL: [Scope; 3] = [Scope::Partition, Scope::Group, Scope::User];

    /// Stem of the dictionary file names, `<stem>_dictionary.csv` and `<stem>_dictionary_sum.csv`.

    pub fn file_stem(self) -> &'static str {
        match self {
            Scope::Partition => "partition",
            Scope::Group => "group",
            Scope::User => "user",
        }
    }

    /// The scope's part of the metric names, eg `day_gpu_part_hours`.

    pub fn metric_infix(self) -> &'static str {
        match self {
            Scope::Partition => "part",
            Scope::Group => "group",
            Scope::User => "user",
        }
    }
}

// GPU class weights.  A weight turns raw GPU-hours on a type of card into allocation units, so that
// usage on different hardware can be compared (and billed) on one scale.
//
// The table is built once from configuration and only read afterwards.

use thiserror::Error;

/// The weights in use when nothing else is configured.  Order matters for lookup, see `lookup`.

pub const DEFAULT_GPU_WEIGHTS: [(&str, f64); 2] = [("h100", 546.9), ("a100", 209.1)];

#[derive(Debug, Error, PartialEq)]
pub enum WeightError {
    #[error("GPU class names must not be empty")]
    EmptyClass,

    #[error("GPU class `{class}` has weight {weight}, weights must be positive and finite")]
    BadWeight { class: String, weight: f64 },

    #[error("GPU class `{0}` is listed twice")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuWeights {
    // Lowercase class name and weight, in lookup order.
    classes: Vec<(String, f64)>,
}

impl GpuWeights {
    /// Build a table from (class, weight) pairs.  Class names are folded to lowercase.

    pub fn new<I, S>(classes: I) -> Result<GpuWeights, WeightError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        let mut table: Vec<(String, f64)> = vec![];
        for (class, weight) in classes {
            let class = class.as_ref().trim().to_lowercase();
            if class.is_empty() {
                return Err(WeightError::EmptyClass);
            }
            if !(weight > 0.0 && weight.is_finite()) {
                return Err(WeightError::BadWeight { class, weight });
            }
            if table.iter().any(|(c, _)| *c == class) {
                return Err(WeightError::Duplicate(class));
            }
            table.push((class, weight));
        }
        Ok(GpuWeights { classes: table })
    }

    /// Find the table entry for a GPU type as it appears in a TRES list.
    ///
    /// Slurm GRES types are site-defined and usually longer than the bare class name, eg
    /// `nvidia_h100_80gb_hbm3`, so after trying for an exact match we take the first entry (in
    /// table order) whose name occurs in the type.  Matching is case-insensitive.

    pub fn lookup(&self, gpu_type: &str) -> Option<(&str, f64)> {
        let gpu_type = gpu_type.to_lowercase();
        self.classes
            .iter()
            .find(|(class, _)| *class == gpu_type)
            .or_else(|| {
                self.classes
                    .iter()
                    .find(|(class, _)| gpu_type.contains(class.as_str()))
            })
            .map(|(class, weight)| (class.as_str(), *weight))
    }

    /// The weight for a job given the GPU types in its TRES list: the last type with a known
    /// weight wins, and 0.0 means none of them is known.

    pub fn weight_for(&self, gpu_types: &[&str]) -> f64 {
        gpu_types
            .iter()
            .filter_map(|t| self.lookup(t))
            .map(|(_, weight)| weight)
            .last()
            .unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.classes.iter().map(|(class, weight)| (class.as_str(), *weight))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for GpuWeights {
    fn default() -> GpuWeights {
        GpuWeights {
            classes: DEFAULT_GPU_WEIGHTS
                .iter()
                .map(|(class, weight)| (class.to_string(), *weight))
                .collect(),
        }
    }
}

#[test]
fn test_lookup() {
    let w = GpuWeights::default();
    assert!(w.lookup("h100") == Some(("h100", 546.9)));
    assert!(w.lookup("A100") == Some(("a100", 209.1)));
    assert!(w.lookup("nvidia_h100_80gb_hbm3") == Some(("h100", 546.9)));
    assert!(w.lookup("NVIDIA_A100-SXM4-40GB") == Some(("a100", 209.1)));
    assert!(w.lookup("nvidia_a40") == None);
    assert!(w.lookup("") == None);
}

#[test]
fn test_weight_for() {
    let w = GpuWeights::default();
    assert!(w.weight_for(&["nvidia_a100"]) == 209.1);
    assert!(w.weight_for(&["a100", "h100"]) == 546.9);
    assert!(w.weight_for(&["h100", "a40"]) == 546.9);
    assert!(w.weight_for(&["a40"]) == 0.0);
    assert!(w.weight_for(&[]) == 0.0);
}

#[test]
fn test_new() {
    let w = GpuWeights::new([("V100", 60.0), ("a100", 200.0)]).unwrap();
    assert!(w.len() == 2);
    assert!(w.lookup("tesla_v100") == Some(("v100", 60.0)));

    assert!(GpuWeights::new([("", 1.0)]) == Err(WeightError::EmptyClass));
    assert!(matches!(GpuWeights::new([("a100", 0.0)]), Err(WeightError::BadWeight { .. })));
    assert!(matches!(GpuWeights::new([("a100", -3.0)]), Err(WeightError::BadWeight { .. })));
    assert!(matches!(GpuWeights::new([("a100", f64::NAN)]), Err(WeightError::BadWeight { .. })));
    assert!(GpuWeights::new([("a100", 1.0), ("A100", 2.0)]) == Err(WeightError::Duplicate("a100".to_string())));
}

// Per-job usage figures, and the accumulator they are summed into.

use crate::elapsed::{elapsed_hours, ElapsedError};
use crate::tres::{gpu_classes, gpu_count, parse_tres_lenient};
use crate::weights::GpuWeights;
use crate::JobRecord;
use std::ops::{Add, AddAssign};

/// The accumulator value.  All fields are non-negative, and since jobs only ever add to them they
/// never decrease as records are merged.

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct UsageTriple {
    /// Wall-clock hours, not scaled by anything.
    pub elapsed_hours: f64,

    /// Elapsed hours times the number of cards.
    pub gpu_hours: f64,

    /// GPU hours times the class weight.
    pub weighted_gpu_hours: f64,
}

impl UsageTriple {
    pub fn new(elapsed_hours: f64, gpu_count: u32, weight: f64) -> UsageTriple {
        let gpu_hours = elapsed_hours * gpu_count as f64;
        UsageTriple {
            elapsed_hours,
            gpu_hours,
            weighted_gpu_hours: gpu_hours * weight,
        }
    }
}

impl Add for UsageTriple {
    type Output = UsageTriple;

    fn add(self, other: UsageTriple) -> UsageTriple {
        UsageTriple {
            elapsed_hours: self.elapsed_hours + other.elapsed_hours,
            gpu_hours: self.gpu_hours + other.gpu_hours,
            weighted_gpu_hours: self.weighted_gpu_hours + other.weighted_gpu_hours,
        }
    }
}

impl AddAssign for UsageTriple {
    fn add_assign(&mut self, other: UsageTriple) {
        *self = *self + other;
    }
}

/// What a job is worth.  Only `Billable` jobs reach any aggregate; the other two are reported.

#[derive(Debug, Clone, PartialEq)]
pub enum Billing {
    Billable(UsageTriple),

    /// The TRES list has no usable `gres/gpu=N`.
    NoGpuCount,

    /// The job has GPUs but none of its GPU types has a weight.  `classes` may be empty if the TRES
    /// list does not name a type at all.
    UnknownClass { classes: Vec<String>, gpu_hours: f64 },
}

/// Compute the usage of one job.  The elapsed time is only looked at once we know the job has
/// GPUs, so a job without a GPU count never fails on its elapsed field.

pub fn compute_usage(job: &JobRecord, weights: &GpuWeights) -> Result<Billing, ElapsedError> {
    let tokens = parse_tres_lenient(&job.resource_spec);
    let count = gpu_count(&tokens);
    if count == 0 {
        return Ok(Billing::NoGpuCount);
    }
    let hours = elapsed_hours(&job.elapsed_wall)?;
    let classes = gpu_classes(&tokens);
    let weight = weights.weight_for(&classes);
    if weight == 0.0 {
        return Ok(Billing::UnknownClass {
            classes: classes.iter().map(|c| c.to_string()).collect(),
            gpu_hours: hours * count as f64,
        });
    }
    Ok(Billing::Billable(UsageTriple::new(hours, count, weight)))
}

#[cfg(test)]
fn job(elapsed: &str, tres: &str) -> JobRecord {
    JobRecord {
        user_id: "alice".to_string(),
        group_id: "kempner_lab".to_string(),
        partition_id: "kempner".to_string(),
        elapsed_wall: elapsed.to_string(),
        resource_spec: tres.to_string(),
        node_name: "holygpu8a11101".to_string(),
    }
}

#[test]
fn test_compute_usage() {
    let weights = GpuWeights::new([("h100", 546.9)]).unwrap();
    match compute_usage(&job("00:10:00", "cpu=4,gres/gpu:h100=2,gres/gpu=2"), &weights).unwrap() {
        Billing::Billable(u) => {
            assert!((u.elapsed_hours - 1.0 / 6.0).abs() < 1e-9);
            assert!((u.gpu_hours - 1.0 / 3.0).abs() < 1e-9);
            assert!((u.weighted_gpu_hours - 182.3).abs() < 1e-9);
        }
        x => panic!("unexpected {:?}", x),
    }
}

#[test]
fn test_compute_usage_excluded() {
    let weights = GpuWeights::default();

    // No count, and the broken elapsed field is never looked at
    assert!(compute_usage(&job("garbage", "cpu=4,gres/gpu:a100=2"), &weights).unwrap() == Billing::NoGpuCount);
    assert!(compute_usage(&job("01:00:00", "gres/gpu=0"), &weights).unwrap() == Billing::NoGpuCount);

    assert!(
        compute_usage(&job("02:00:00", "gres/gpu:nvidia_a40=1,gres/gpu=1"), &weights).unwrap()
            == Billing::UnknownClass { classes: vec!["nvidia_a40".to_string()], gpu_hours: 2.0 }
    );
    assert!(
        compute_usage(&job("01:00:00", "gres/gpu=3"), &weights).unwrap()
            == Billing::UnknownClass { classes: vec![], gpu_hours: 3.0 }
    );

    // A count but a bad elapsed field is an error
    assert!(compute_usage(&job("1:00", "gres/gpu:a100=1,gres/gpu=1"), &weights).is_err());
}

#[test]
fn test_usage_add() {
    let mut a = UsageTriple::new(1.0, 2, 10.0);
    a += UsageTriple::new(0.5, 4, 1.0);
    assert!(a.elapsed_hours == 1.5);
    assert!(a.gpu_hours == 4.0);
    assert!(a.weighted_gpu_hours == 22.0);
    assert!(a + UsageTriple::default() == a);
}

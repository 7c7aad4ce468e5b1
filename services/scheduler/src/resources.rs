//! CPU and memory accounting for pods.
//!
//! A container without a positive limit is "unbounded" and is charged the
//! configured per-container default. A pod is unbounded for a resource if any
//! of its containers is.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Mul};

use serde::{Deserialize, Serialize};

use crate::model::{Container, Pod};

macro_rules! quantity {
    ($name:ident, $unit:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub f64);

        impl $name {
            pub fn value(self) -> f64 {
                self.0
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl Mul<f64> for $name {
            type Output = Self;

            fn mul(self, rhs: f64) -> Self {
                Self(self.0 * rhs)
            }
        }

        impl Sum for $name {
            fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
                iter.fold(Self(0.0), Add::add)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", self.0, $unit)
            }
        }
    };
}

quantity!(CpuCores, "cpu");
quantity!(MegaBytes, "MiB");

/// CPU charged per container that declares no limit.
pub const DEFAULT_CONTAINER_CPU_LIMIT: CpuCores = CpuCores(0.25);

/// Memory charged per container that declares no limit.
pub const DEFAULT_CONTAINER_MEM_LIMIT: MegaBytes = MegaBytes(64.0);

fn explicit_cpu(container: &Container) -> Option<CpuCores> {
    container.resources.limits.cpu.filter(|c| c.0 > 0.0)
}

fn explicit_mem(container: &Container) -> Option<MegaBytes> {
    container.resources.limits.memory.filter(|m| m.0 > 0.0)
}

/// CPU the pod needs, charging `default` for every unbounded container.
pub fn cpu_for_pod(pod: &Pod, default: CpuCores) -> CpuCores {
    pod.spec
        .containers
        .iter()
        .map(|c| explicit_cpu(c).unwrap_or(default))
        .sum()
}

/// Memory the pod needs, charging `default` for every unbounded container.
pub fn mem_for_pod(pod: &Pod, default: MegaBytes) -> MegaBytes {
    pod.spec
        .containers
        .iter()
        .map(|c| explicit_mem(c).unwrap_or(default))
        .sum()
}

/// Write `default` into every container lacking a CPU limit.
///
/// Returns true if at least one container was unbounded.
pub fn limit_pod_cpu(pod: &mut Pod, default: CpuCores) -> bool {
    let mut unbounded = false;
    for container in &mut pod.spec.containers {
        if explicit_cpu(container).is_none() {
            container.resources.limits.cpu = Some(default);
            unbounded = true;
        }
    }
    unbounded
}

/// Write `default` into every container lacking a memory limit.
///
/// Returns true if at least one container was unbounded.
pub fn limit_pod_mem(pod: &mut Pod, default: MegaBytes) -> bool {
    let mut unbounded = false;
    for container in &mut pod.spec.containers {
        if explicit_mem(container).is_none() {
            container.resources.limits.memory = Some(default);
            unbounded = true;
        }
    }
    unbounded
}

/// Sum of the declared CPU limits; unbounded containers count as zero.
pub fn pod_cpu_limit(pod: &Pod) -> CpuCores {
    pod.spec.containers.iter().filter_map(explicit_cpu).sum()
}

/// Sum of the declared memory limits; unbounded containers count as zero.
pub fn pod_mem_limit(pod: &Pod) -> MegaBytes {
    pod.spec.containers.iter().filter_map(explicit_mem).sum()
}

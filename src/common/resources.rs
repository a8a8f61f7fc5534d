//! Host resource probing for heartbeat publications

use crate::common::meta::{keys, AttrMap, MetaValue};
use std::sync::Mutex;
use sysinfo::System;

/// Point-in-time resource usage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// Logical cpus
    pub cpu_capacity: f64,
    /// Cpus busy (capacity * global usage)
    pub cpu_used: f64,
    /// Bytes
    pub memory_capacity: u64,
    /// Bytes
    pub memory_used: u64,
}

impl ResourceUsage {
    /// Attributes under the recognized metadata keys
    pub fn to_attrs(&self) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert(
            keys::CPU_CAPACITY.to_string(),
            MetaValue::Float(self.cpu_capacity),
        );
        attrs.insert(keys::CPU_USED.to_string(), MetaValue::Float(self.cpu_used));
        attrs.insert(
            keys::MEMORY_CAPACITY.to_string(),
            MetaValue::Int(self.memory_capacity as i64),
        );
        attrs.insert(
            keys::MEMORY_USED.to_string(),
            MetaValue::Int(self.memory_used as i64),
        );
        attrs
    }
}

/// Source of resource usage samples
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Samples the local host through sysinfo
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceUsage {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu();
        system.refresh_memory();
        let cpus = system.cpus().len().max(1) as f64;
        let usage = system.global_cpu_info().cpu_usage() as f64 / 100.0;
        ResourceUsage {
            cpu_capacity: cpus,
            cpu_used: (cpus * usage).clamp(0.0, cpus),
            memory_capacity: system.total_memory(),
            memory_used: system.used_memory(),
        }
    }
}

/// Always reports the same usage
pub struct FixedProbe(pub ResourceUsage);

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceUsage {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::meta::MetaNamespace;

    #[test]
    fn test_usage_attrs_match_schema() {
        let usage = FixedProbe(ResourceUsage {
            cpu_capacity: 4.0,
            cpu_used: 1.5,
            memory_capacity: 8 << 30,
            memory_used: 1 << 30,
        })
        .sample();
        let attrs = usage.to_attrs();
        assert!(MetaNamespace::ProcessMeta.validate(&attrs).is_ok());
        assert!(MetaNamespace::ServerMeta.validate(&attrs).is_ok());
        assert_eq!(attrs[keys::MEMORY_USED], MetaValue::Int(1 << 30));
    }

    #[test]
    fn test_system_sampler_reports_capacity() {
        let usage = SystemProbe::new().sample();
        assert!(usage.cpu_capacity >= 1.0);
        assert!(usage.cpu_used <= usage.cpu_capacity);
    }
}

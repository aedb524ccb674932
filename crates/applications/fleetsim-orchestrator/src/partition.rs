//! Workload partitioning across worker containers
//!
//! Every quantity (devices, dummy-work devices, crashing devices) is split the
//! same way: each worker gets `value / workers`, and the remainder is handed
//! out one unit at a time starting from worker 0. Totals are conserved and the
//! assignment only depends on the inputs, so re-runs are reproducible.

use crate::config::SimulationConfig;
use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};

/// Behavioral perturbations assigned to one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Influence {
    /// Devices doing extra dummy work
    #[serde(rename = "dummyWork")]
    pub dummy_work: u64,

    /// Devices simulating a crash
    pub crash: u64,
}

/// One device-simulator container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Ordinal of the worker, also its name suffix
    pub index: u32,

    /// HTTP control port
    pub port: u16,

    /// Devices hosted by this worker
    pub devices: u64,

    /// Index of this worker's first device
    pub offset: u64,

    /// Perturbations applied to this worker's devices
    pub influence: Influence,
}

/// Split `value` into `parts` shares differing by at most one
pub fn split(value: u64, parts: u32) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }

    let parts_u64 = u64::from(parts);
    let base = value / parts_u64;
    let remainder = value % parts_u64;

    (0..parts_u64)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Build the worker plan for a configuration
pub fn plan_workers(config: &SimulationConfig) -> Result<Vec<WorkerSpec>> {
    let population = config.client.number_of_devices;
    let workers = config.client.number_of_containers;
    let base_port = config.client.http_server_base_port;

    let scenario = config.simulation.as_ref();
    let dummy_total = match scenario.and_then(|s| s.dummy_work.as_ref()) {
        Some(spec) => spec.affected(population)?,
        None => 0,
    };
    let crash_total = match scenario.and_then(|s| s.crash.as_ref()) {
        Some(spec) => spec.affected(population)?,
        None => 0,
    };

    let devices = split(population, workers);
    let dummy = split(dummy_total, workers);
    let crash = split(crash_total, workers);

    let mut offset = 1;
    let mut plan = Vec::with_capacity(devices.len());
    for (i, count) in devices.into_iter().enumerate() {
        let port = u16::try_from(i)
            .ok()
            .and_then(|i| base_port.checked_add(i))
            .ok_or_else(|| {
                SimulationError::config(format!(
                    "worker {} has no control port above {}",
                    i, base_port
                ))
            })?;
        plan.push(WorkerSpec {
            index: i as u32,
            port,
            devices: count,
            offset,
            influence: Influence {
                dummy_work: dummy[i],
                crash: crash[i],
            },
        });
        offset += count;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InfluenceSpec, ScenarioConfig};

    fn config(devices: u64, containers: u32) -> SimulationConfig {
        let raw = format!(
            "output:\n  path: /tmp/out\nclient:\n  numberOfDevices: {}\n  numberOfContainers: {}\n",
            devices, containers
        );
        SimulationConfig::from_yaml(&raw).unwrap()
    }

    #[test]
    fn test_ten_devices_three_workers() {
        assert_eq!(split(10, 3), vec![4, 3, 3]);

        let plan = plan_workers(&config(10, 3)).unwrap();
        let counts: Vec<u64> = plan.iter().map(|w| w.devices).collect();
        let offsets: Vec<u64> = plan.iter().map(|w| w.offset).collect();
        let ports: Vec<u16> = plan.iter().map(|w| w.port).collect();

        assert_eq!(counts, vec![4, 3, 3]);
        assert_eq!(offsets, vec![1, 5, 8]);
        assert_eq!(ports, vec![8086, 8087, 8088]);
    }

    #[test]
    fn test_split_conserves_and_is_fair() {
        for population in 0..200u64 {
            for workers in 1..17u32 {
                let shares = split(population, workers);
                assert_eq!(shares.len(), workers as usize);
                assert_eq!(shares.iter().sum::<u64>(), population);

                let base = population / u64::from(workers);
                assert!(shares.iter().all(|&s| s == base || s == base + 1));
                // remainder goes to the lowest ordinals
                assert!(shares.windows(2).all(|w| w[0] >= w[1]));
            }
        }
    }

    #[test]
    fn test_more_workers_than_devices() {
        assert_eq!(split(2, 5), vec![1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_percent_influence_split() {
        let mut cfg = config(50, 3);
        cfg.simulation = Some(ScenarioConfig {
            task: None,
            dummy_work: Some(InfluenceSpec::number(4)),
            crash: Some(InfluenceSpec::percent("20%")),
        });

        let plan = plan_workers(&cfg).unwrap();
        let crash: Vec<u64> = plan.iter().map(|w| w.influence.crash).collect();
        let dummy: Vec<u64> = plan.iter().map(|w| w.influence.dummy_work).collect();

        assert_eq!(crash.iter().sum::<u64>(), 10);
        assert_eq!(crash, vec![4, 3, 3]);
        assert_eq!(dummy, vec![2, 1, 1]);
    }

    #[test]
    fn test_influence_serialization() {
        let influence = Influence {
            dummy_work: 2,
            crash: 1,
        };
        let json = serde_json::to_string(&influence).unwrap();
        assert_eq!(json, r#"{"dummyWork":2,"crash":1}"#);
    }

    #[test]
    fn test_ports_past_u16_are_rejected() {
        let mut config = config(4, 3);
        config.client.http_server_base_port = 65534;
        assert!(matches!(plan_workers(&config), Err(SimulationError::Config(_))));

        config.client.http_server_base_port = 65533;
        let ports: Vec<u16> = plan_workers(&config).unwrap().iter().map(|w| w.port).collect();
        assert_eq!(ports, vec![65533, 65534, 65535]);
    }
}

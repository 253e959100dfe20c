//! JSON output: results with a hardware and run-configuration header.

use std::fs;
use std::path::Path;

use forge_compute::HardwareInfo;
use serde::Serialize;

use crate::error::BenchError;
use crate::harness::{BenchConfig, DataPoint};

#[derive(Serialize)]
struct JsonReport<'a> {
    hardware: &'a HardwareInfo,
    config: &'a BenchConfig,
    timestamp: String,
    results: &'a [DataPoint],
}

pub fn write_json(
    path: &Path,
    data: &[DataPoint],
    hardware: &HardwareInfo,
    config: &BenchConfig,
) -> Result<(), BenchError> {
    let report = JsonReport {
        hardware,
        config,
        timestamp: chrono::Utc::now().to_rfc3339(),
        results: data,
    };
    let json = serde_json::to_string_pretty(&report)?;

    let io_err = |source: std::io::Error| BenchError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, json).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_gen::Distribution;
    use crate::stats::Stats;

    #[test]
    fn test_write_json_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/results.json");
        let hardware = HardwareInfo {
            device_name: "warp32".to_string(),
            backend: "software".to_string(),
            subgroup_width: 32,
            max_group_size: 1024,
            max_shared_bytes: 48 * 1024,
            worker_threads: 4,
        };
        let config = BenchConfig {
            profile: Some("quick"),
            sizes: vec![1000],
            runs: 3,
            warmup: 1,
            distribution: Distribution::Sorted,
            seed: 5,
        };
        let data = vec![DataPoint {
            contender: "std".to_string(),
            distribution: Distribution::Sorted,
            size: 1000,
            stats: Some(Stats::from_samples(&[1.0, 2.0, 3.0])),
            mkeys_per_sec: 0.5,
            speedup_vs_std: Some(1.0),
            validated: true,
            stable: true,
            engine: None,
            error: None,
        }];

        write_json(&path, &data, &hardware, &config).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["hardware"]["subgroup_width"], 32);
        assert_eq!(value["hardware"]["backend"], "software");
        assert_eq!(value["config"]["distribution"], "sorted");
        assert_eq!(value["config"]["profile"], "quick");
        assert_eq!(value["results"][0]["contender"], "std");
        assert_eq!(value["results"][0]["stats"]["median"], 2.0);
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }
}

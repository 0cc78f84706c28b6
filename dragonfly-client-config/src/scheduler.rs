/*
 *     Copyright 2023 The Dragonfly Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// DynconfigConfig controls how the scheduler refreshes Manager-sourced
/// dynamic configuration (the scheduler list, application list) that the
/// Evaluator's affinity terms and the seed-peer trigger consume.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DynconfigConfig {
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for DynconfigConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// SchedulerConfig holds the core-relevant recognized configuration keys of
/// spec §6's table, plus the evaluator weights of §4.3.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulerConfig {
    /// filter_parent_limit caps candidates returned per schedule call.
    #[validate(range(min = 1, max = 200))]
    pub filter_parent_limit: u32,

    /// back_to_source_count caps concurrent back-to-source peers per task.
    pub back_to_source_count: u32,

    /// retry_back_to_source_limit caps reschedule attempts before back-to-source.
    pub retry_back_to_source_limit: u32,

    #[serde(with = "humantime_serde")]
    pub piece_download_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub reschedule_peer_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub peer_gc_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub task_gc_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub host_gc_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub peer_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub task_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub host_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub announce_peer_stream_idle_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub graceful_stop_timeout: Duration,

    #[serde(with = "bytesize_serde")]
    pub tiny_task_size_threshold: bytesize::ByteSize,

    #[serde(with = "bytesize_serde")]
    pub small_task_size_threshold: bytesize::ByteSize,

    pub dynconfig: DynconfigConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            filter_parent_limit: 15,
            back_to_source_count: 200,
            retry_back_to_source_limit: 5,
            piece_download_timeout: Duration::from_secs(30),
            reschedule_peer_timeout: Duration::from_secs(8),
            peer_gc_interval: Duration::from_secs(10 * 60),
            task_gc_interval: Duration::from_secs(30 * 60),
            host_gc_interval: Duration::from_secs(30 * 60),
            peer_ttl: Duration::from_secs(24 * 60 * 60),
            task_ttl: Duration::from_secs(24 * 60 * 60),
            host_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            announce_peer_stream_idle_timeout: Duration::from_secs(2 * 60),
            graceful_stop_timeout: Duration::from_secs(10),
            tiny_task_size_threshold: bytesize::ByteSize::kib(1),
            small_task_size_threshold: bytesize::ByteSize::kib(128),
            dynconfig: DynconfigConfig::default(),
        }
    }
}

/// NetworkTopologyConfig controls the probe subsystem (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetworkTopologyConfig {
    pub enable: bool,

    /// queue_length is the bounded FIFO capacity per (source, destination) pair.
    #[validate(range(min = 1, max = 100))]
    pub probe_queue_length: usize,

    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub collect_interval: Duration,
}

impl Default for NetworkTopologyConfig {
    fn default() -> Self {
        Self {
            enable: true,
            probe_queue_length: 5,
            probe_interval: Duration::from_secs(15 * 60),
            collect_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// EvaluatorWeightsConfig allows tuning the scoring weights of §4.3 without
/// changing their signs or rough proportions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EvaluatorWeightsConfig {
    pub finished_piece_score: f64,
    pub host_upload_success_score: f64,
    pub free_upload_score: f64,
    pub host_type_affinity_score: f64,
    pub location_affinity_score: f64,
    pub network_topology_score: f64,
}

impl Default for EvaluatorWeightsConfig {
    fn default() -> Self {
        Self {
            finished_piece_score: 0.3,
            host_upload_success_score: 0.3,
            free_upload_score: 0.2,
            host_type_affinity_score: 0.1,
            location_affinity_score: 0.1,
            network_topology_score: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub network_topology: NetworkTopologyConfig,
    pub evaluator_weights: EvaluatorWeightsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            network_topology: NetworkTopologyConfig::default(),
            evaluator_weights: EvaluatorWeightsConfig::default(),
        }
    }
}

impl Config {
    /// load reads YAML configuration from `path`, falling back to defaults
    /// for any key it does not set.
    pub fn load(path: &std::path::Path) -> Result<Self, dragonfly_client_core::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| dragonfly_client_core::error::invalid_argument(e.to_string()))?;
        config
            .validate()
            .map_err(|e| dragonfly_client_core::error::invalid_argument(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn loads_partial_yaml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.yaml");
        std::fs::write(&path, "scheduler:\n  filter_parent_limit: 20\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.scheduler.filter_parent_limit, 20);
        assert_eq!(config.scheduler.back_to_source_count, 200);
    }
}

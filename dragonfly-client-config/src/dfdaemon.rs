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
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// DownloadConfig controls the client-side Piece Synchronizer (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DownloadConfig {
    /// concurrent_piece_count is the in-flight window per parent (default 4).
    #[validate(range(min = 1, max = 64))]
    pub concurrent_piece_count: u32,

    #[serde(with = "humantime_serde")]
    pub piece_download_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub reschedule_peer_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrent_piece_count: 4,
            piece_download_timeout: Duration::from_secs(30),
            reschedule_peer_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/dragonfly"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    pub download: DownloadConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
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

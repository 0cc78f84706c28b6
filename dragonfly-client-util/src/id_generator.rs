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

use dragonfly_client_core::{id, Error};

/// IdGenerator bakes a host's IP/hostname in once so call sites don't have to
/// thread them through every task/peer id computation, mirroring the
/// teacher's `self.task.id_generator.task_id(...)` call pattern.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    ip: String,
    hostname: String,
    host_id: String,
}

impl IdGenerator {
    pub fn new(ip: String, hostname: String) -> Self {
        let host_id = id::host_id(&ip, &hostname);
        Self {
            ip,
            hostname,
            host_id,
        }
    }

    /// host_id returns this daemon/scheduler's own HostID.
    pub fn host_id(&self) -> String {
        self.host_id.clone()
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// task_id derives a TaskID for the given download parameters (§4.1).
    #[allow(clippy::too_many_arguments)]
    pub fn task_id(
        &self,
        url: &str,
        digest: Option<&str>,
        tag: Option<&str>,
        application: Option<&str>,
        piece_length: Option<u64>,
        filtered_query_params: Vec<String>,
    ) -> Result<String, Error> {
        id::task_id(
            url,
            digest,
            tag,
            application,
            piece_length,
            &filtered_query_params,
        )
    }

    /// peer_id derives a fresh PeerID scoped to `task_id`.
    pub fn peer_id(&self, task_id: &str) -> String {
        id::peer_id(&self.host_id, task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_scoped_to_host_and_task() {
        let gen = IdGenerator::new("10.0.0.5".to_string(), "host-a".to_string());
        let task_id = gen
            .task_id("https://example.com/x", None, None, None, None, vec![])
            .unwrap();
        let peer_id = gen.peer_id(&task_id);
        assert!(peer_id.starts_with(&gen.host_id()));
    }
}

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

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// HostType distinguishes normal peers from the seed tiers that are allowed
/// to back-source from origin (§3 Host, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostType {
    Normal,
    SuperSeed,
    StrongSeed,
    WeakSeed,
}

impl HostType {
    pub fn is_seed(&self) -> bool {
        !matches!(self, HostType::Normal)
    }
}

/// CpuSnapshot, MemorySnapshot, NetworkSnapshot and DiskSnapshot are the
/// host metadata fields carried by `AnnounceHost` (§3 Host). The scheduler
/// never interprets them beyond what the Evaluator's affinity term reads
/// (location/IDC), but they need somewhere to live.
#[derive(Debug, Clone, Default)]
pub struct CpuSnapshot {
    pub logical_count: u32,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkSnapshot {
    pub location: Option<String>,
    pub idc: Option<String>,
    pub download_rate_bytes: u64,
    pub upload_rate_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DiskSnapshot {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Host is a physical or logical uploader (§3 Host).
#[derive(Debug)]
pub struct Host {
    pub id: String,
    pub ip: String,
    pub hostname: String,
    pub port: u32,
    pub download_port: u32,
    pub host_type: HostType,
    pub concurrent_upload_limit: u32,
    concurrent_upload_count: AtomicU64,
    upload_count: AtomicU64,
    upload_failed_count: AtomicU64,
    pub os: Option<String>,
    pub platform: Option<String>,
    pub build_version: Option<String>,
    pub cpu: CpuSnapshot,
    pub memory: MemorySnapshot,
    pub network: NetworkSnapshot,
    pub disk: DiskSnapshot,
    pub created_at: DateTime<Utc>,
    updated_at: parking_lot::Mutex<DateTime<Utc>>,
}

impl Host {
    pub fn new(
        id: String,
        ip: String,
        hostname: String,
        port: u32,
        download_port: u32,
        host_type: HostType,
        concurrent_upload_limit: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            ip,
            hostname,
            port,
            download_port,
            host_type,
            concurrent_upload_limit,
            concurrent_upload_count: AtomicU64::new(0),
            upload_count: AtomicU64::new(0),
            upload_failed_count: AtomicU64::new(0),
            os: None,
            platform: None,
            build_version: None,
            cpu: CpuSnapshot::default(),
            memory: MemorySnapshot::default(),
            network: NetworkSnapshot::default(),
            disk: DiskSnapshot::default(),
            created_at: now,
            updated_at: parking_lot::Mutex::new(now),
        }
    }

    pub fn concurrent_upload_count(&self) -> u64 {
        self.concurrent_upload_count.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> u64 {
        self.upload_count.load(Ordering::SeqCst)
    }

    pub fn upload_failed_count(&self) -> u64 {
        self.upload_failed_count.load(Ordering::SeqCst)
    }

    /// has_free_upload_slot checks the invariant of §3 Host:
    /// `ConcurrentUploadCount <= ConcurrentUploadLimit`.
    pub fn has_free_upload_slot(&self) -> bool {
        self.concurrent_upload_count() < self.concurrent_upload_limit as u64
    }

    /// upload_success_rate = 1 - UploadFailedCount/max(1, UploadCount) (§4.3).
    pub fn upload_success_rate(&self) -> f64 {
        let count = self.upload_count().max(1);
        1.0 - (self.upload_failed_count() as f64 / count as f64)
    }

    /// free_upload_slot_ratio = 1 - ConcurrentUploadCount/ConcurrentUploadLimit (§4.3).
    pub fn free_upload_slot_ratio(&self) -> f64 {
        if self.concurrent_upload_limit == 0 {
            return 0.0;
        }
        1.0 - (self.concurrent_upload_count() as f64 / self.concurrent_upload_limit as f64)
    }

    /// acquire_upload_slot increments the concurrent-upload counter. Returns
    /// false (and leaves the counter untouched) if the host is already at
    /// its limit, so callers must release on every exit path only after a
    /// successful acquire (§5, "Scoped resources").
    pub fn acquire_upload_slot(&self) -> bool {
        loop {
            let current = self.concurrent_upload_count.load(Ordering::SeqCst);
            if current >= self.concurrent_upload_limit as u64 {
                return false;
            }
            if self
                .concurrent_upload_count
                .compare_exchange(
                    current,
                    current + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_upload_slot(&self) {
        let _ = self
            .concurrent_upload_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn record_upload_success(&self) {
        self.upload_count.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn record_upload_failure(&self) {
        self.upload_count.fetch_add(1, Ordering::SeqCst);
        self.upload_failed_count.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn touch(&self) {
        *self.updated_at.lock() = Utc::now();
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_slot_respects_limit() {
        let host = Host::new(
            "h1".into(),
            "10.0.0.1".into(),
            "node-a".into(),
            8080,
            8081,
            HostType::Normal,
            1,
        );
        assert!(host.acquire_upload_slot());
        assert!(!host.acquire_upload_slot(), "limit of 1 must not allow a second slot");
        host.release_upload_slot();
        assert!(host.acquire_upload_slot());
    }

    #[test]
    fn upload_success_rate_starts_at_one() {
        let host = Host::new(
            "h1".into(),
            "10.0.0.1".into(),
            "node-a".into(),
            8080,
            8081,
            HostType::Normal,
            10,
        );
        assert_eq!(host.upload_success_rate(), 1.0);
        host.record_upload_failure();
        assert!(host.upload_success_rate() < 1.0);
    }
}

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

use tokio::sync::broadcast;

/// Shutdown is a cloneable graceful-shutdown signal: every long-running
/// component (the two gRPC servers, the GC sweepers, the probe collector)
/// holds a clone and awaits `recv()` alongside its own work.
pub struct Shutdown {
    is_shutdown: bool,
    receiver: broadcast::Receiver<()>,
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            is_shutdown: self.is_shutdown,
            receiver: self.receiver.resubscribe(),
        }
    }
}

impl Shutdown {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            is_shutdown: false,
            receiver,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.receiver.recv().await;
        self.is_shutdown = true;
    }
}

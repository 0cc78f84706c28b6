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

pub mod graph;
pub mod host;
pub mod manager;
pub mod peer;
pub mod piece;
pub mod task;

pub use graph::Graph;
pub use host::{Host, HostType};
pub use manager::{HostManager, TaskEntry, TaskManager};
pub use peer::{Peer, PeerState, Priority};
pub use piece::Piece;
pub use task::{Digest, Task, TaskState};

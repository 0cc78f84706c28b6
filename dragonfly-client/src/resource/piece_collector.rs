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

use std::time::Duration;

/// Parent is the candidate parent peer a piece can be collected from (§4.6
/// "Set of currently assigned parents").
#[derive(Debug, Clone)]
pub struct Parent {
    pub id: String,
    pub host_id: String,
    pub ip: String,
    pub upload_port: u32,
}

/// CollectedPiece is one piece descriptor reported ready by a parent's
/// piece-sync sub-stream (§4.6 step 2: "a parent streams piece descriptors
/// as they become available on its side").
#[derive(Debug, Clone)]
pub struct CollectedPiece {
    pub number: u32,
    pub offset: u64,
    pub length: u64,
    pub parent: Parent,
    /// observed_cost is the parent's most recently measured cost (RTT or
    /// last download latency), used to break ties in `select_with` (§4.6
    /// step 4: "prefer the parent with lowest observed cost").
    pub observed_cost: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collected_piece_carries_parent_identity() {
        let piece = CollectedPiece {
            number: 3,
            offset: 12_582_912,
            length: 4_194_304,
            parent: Parent {
                id: "peer-a".into(),
                host_id: "host-a".into(),
                ip: "10.0.0.1".into(),
                upload_port: 4000,
            },
            observed_cost: Duration::from_millis(40),
        };
        assert_eq!(piece.parent.id, "peer-a");
        assert_eq!(piece.number, 3);
    }
}

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
use std::time::Duration;

/// Piece is the scheduler-side record of a finished piece a peer reports
/// (§3 Piece): the scheduler only ever sees finished pieces (unlike the
/// client's `PieceStore`, which also tracks in-flight ones).
#[derive(Debug, Clone)]
pub struct Piece {
    pub number: u32,
    pub offset: u64,
    pub length: u64,
    pub digest: String,
    pub parent_id: Option<String>,
    pub cost: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

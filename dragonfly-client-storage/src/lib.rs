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

pub mod cache;
pub mod piece;

pub use cache::ManagerClientCache;
pub use piece::{Piece, PieceState, PieceStore};

use std::time::Duration;

/// DEFAULT_WAIT_FOR_PIECE_FINISHED_INTERVAL is the poll interval the
/// `sync_pieces` stream handler uses while waiting for an in-flight piece to
/// finish, matching the teacher's constant of the same name.
pub const DEFAULT_WAIT_FOR_PIECE_FINISHED_INTERVAL: Duration = Duration::from_millis(500);

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

pub mod piece_collector;
pub mod piece_selector;
pub mod piece_synchronizer;

pub use piece_collector::{CollectedPiece, Parent};
pub use piece_selector::PieceSelector;
pub use piece_synchronizer::{
    DownloadedPiece, Outcome, ParentClient, ParentClientFactory, PieceSynchronizer,
    SchedulerReporter, SynchronizerConfig,
};

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
use dragonfly_client_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncRead;

/// Piece is the local record of a single content slice (spec §3, Piece).
/// `state` tracks whether the content is merely reserved (started, an
/// in-flight download from some parent owns it) or finished (durable on
/// disk and safe to serve to other peers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Piece {
    pub number: u32,
    pub offset: u64,
    pub length: u64,
    pub digest: String,
    pub parent_id: Option<String>,
    pub cost: Option<std::time::Duration>,
    pub created_at: DateTime<Utc>,
    pub state: PieceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceState {
    Started,
    Finished,
}

impl Piece {
    pub fn is_started(&self) -> bool {
        self.state == PieceState::Started
    }

    pub fn is_finished(&self) -> bool {
        self.state == PieceState::Finished
    }
}

/// PieceStore is the client's local index of pieces it has fetched, plus
/// the on-disk content backing them. Spec §1 places OS-level storage layout
/// out of scope, so this is deliberately a thin index rather than a
/// faithful reproduction of the reference implementation's on-disk format:
/// metadata lives in memory, content lives in one file per piece under
/// `<dir>/<task_id>/<number>`.
pub struct PieceStore {
    dir: PathBuf,
    metadata: Mutex<HashMap<(String, u32), Piece>>,
}

impl PieceStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            metadata: Mutex::new(HashMap::new()),
        }
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.dir.join(task_id)
    }

    fn piece_path(&self, task_id: &str, number: u32) -> PathBuf {
        self.task_dir(task_id).join(number.to_string())
    }

    /// started records that a download of this piece has begun, so
    /// `sync_pieces` peers can observe "in-flight" state and keep waiting
    /// rather than assume the piece will never arrive.
    pub fn started(&self, task_id: &str, number: u32, offset: u64, length: u64) -> Result<()> {
        let mut metadata = self.metadata.lock().unwrap();
        metadata.insert(
            (task_id.to_string(), number),
            Piece {
                number,
                offset,
                length,
                digest: String::new(),
                parent_id: None,
                cost: None,
                created_at: Utc::now(),
                state: PieceState::Started,
            },
        );
        Ok(())
    }

    /// finished persists the piece content to disk and marks it finished.
    pub async fn finished(
        &self,
        task_id: &str,
        number: u32,
        offset: u64,
        digest: String,
        parent_id: Option<String>,
        cost: Option<std::time::Duration>,
        content: &[u8],
    ) -> Result<()> {
        let task_dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&task_dir).await?;
        tokio::fs::write(self.piece_path(task_id, number), content).await?;

        let mut metadata = self.metadata.lock().unwrap();
        metadata.insert(
            (task_id.to_string(), number),
            Piece {
                number,
                offset,
                length: content.len() as u64,
                digest,
                parent_id,
                cost,
                created_at: Utc::now(),
                state: PieceState::Finished,
            },
        );
        Ok(())
    }

    /// get returns the piece metadata, mirroring the teacher's
    /// `task.piece.get(task_id, number)`.
    pub fn get(&self, task_id: &str, number: u32) -> Result<Option<Piece>> {
        Ok(self
            .metadata
            .lock()
            .unwrap()
            .get(&(task_id.to_string(), number))
            .cloned())
    }

    /// finished_pieces returns every finished piece for a task, in number order.
    pub fn finished_pieces(&self, task_id: &str) -> Vec<Piece> {
        let metadata = self.metadata.lock().unwrap();
        let mut pieces: Vec<Piece> = metadata
            .iter()
            .filter(|((tid, _), piece)| tid == task_id && piece.is_finished())
            .map(|(_, piece)| piece.clone())
            .collect();
        pieces.sort_by_key(|p| p.number);
        pieces
    }

    pub fn finished_count(&self, task_id: &str) -> u32 {
        self.finished_pieces(task_id).len() as u32
    }

    /// download_from_local_peer_into_async_read opens the on-disk content of
    /// a finished piece for another peer to read, mirroring the teacher's
    /// method of the same name used by the upload grpc handler.
    pub async fn download_from_local_peer_into_async_read(
        &self,
        task_id: &str,
        number: u32,
    ) -> Result<impl AsyncRead + Unpin> {
        let file = tokio::fs::File::open(self.piece_path(task_id, number)).await?;
        Ok(file)
    }

    /// remove_task drops all in-memory metadata and on-disk content for a
    /// task, used by GC when a task reaches its TTL.
    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        self.metadata
            .lock()
            .unwrap()
            .retain(|(tid, _), _| tid != task_id);
        let dir = self.task_dir(task_id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finished_piece_is_readable_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path().to_path_buf());

        store.started("task-1", 0, 0, 4).unwrap();
        assert!(store.get("task-1", 0).unwrap().unwrap().is_started());

        store
            .finished("task-1", 0, 0, "sha256:abc".to_string(), Some("parent-1".to_string()), None, b"data")
            .await
            .unwrap();

        let piece = store.get("task-1", 0).unwrap().unwrap();
        assert!(piece.is_finished());
        assert_eq!(piece.parent_id.as_deref(), Some("parent-1"));

        let mut reader = store
            .download_from_local_peer_into_async_read("task-1", 0)
            .await
            .unwrap();
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"data");
    }

    #[tokio::test]
    async fn finished_pieces_are_ordered_by_number() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path().to_path_buf());
        for n in [2u32, 0, 1] {
            store
                .finished("task-1", n, 0, "sha256:x".to_string(), None, None, b"x")
                .await
                .unwrap();
        }
        let numbers: Vec<u32> = store.finished_pieces("task-1").iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn remove_task_clears_metadata_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(dir.path().to_path_buf());
        store
            .finished("task-1", 0, 0, "sha256:x".to_string(), None, None, b"x")
            .await
            .unwrap();
        store.remove_task("task-1").await.unwrap();
        assert!(store.get("task-1", 0).unwrap().is_none());
    }
}

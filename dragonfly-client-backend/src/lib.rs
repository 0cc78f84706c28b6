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

use dragonfly_client_core::{error::invalid_argument, Error, Result};
use dragonfly_client_util::http::make_range_header;
use reqwest_middleware::ClientWithMiddleware;
use std::collections::HashMap;
use tracing::instrument;

/// OriginBackend fetches content straight from the task's source URL. It is
/// the back-to-source collaborator the Seed-Peer Trigger (§4.7) and the
/// Piece Synchronizer's back-to-source fallback (§4.6) call into; everything
/// about object-storage-specific backends is out of scope (spec §1
/// Non-goals), so this only ever speaks plain HTTP(S) GET.
pub struct OriginBackend {
    client: ClientWithMiddleware,
}

/// HeadResult carries the subset of the origin response the caller needs to
/// size a task (content length, whether range requests are supported).
#[derive(Debug, Clone)]
pub struct HeadResult {
    pub content_length: Option<u64>,
    pub supports_range: bool,
}

impl Default for OriginBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginBackend {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("build reqwest client");
        Self {
            client: reqwest_middleware::ClientBuilder::new(client).build(),
        }
    }

    /// head resolves the content length of `url` (used to decide the
    /// tiny/small/normal task-size tier in Scheduler Core §4.4 step 2).
    #[instrument(skip(self, header))]
    pub async fn head(&self, url: &str, header: HashMap<String, String>) -> Result<HeadResult> {
        let mut request = self.client.head(url);
        for (k, v) in &header {
            request = request.header(k, v);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Unknown(e.to_string()))?;

        let content_length = response.content_length();
        let supports_range = response
            .headers()
            .get("accept-ranges")
            .map(|v| v == "bytes")
            .unwrap_or(false);

        Ok(HeadResult {
            content_length,
            supports_range,
        })
    }

    /// download_piece fetches `[offset, offset+length)` of `url`, used to
    /// back-source a single piece when no parent can supply it.
    #[instrument(skip(self, header))]
    pub async fn download_piece(
        &self,
        url: &str,
        offset: u64,
        length: u64,
        header: HashMap<String, String>,
    ) -> Result<Vec<u8>> {
        let mut request = self
            .client
            .get(url)
            .header("Range", make_range_header(offset, length));
        for (k, v) in &header {
            request = request.header(k, v);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Unknown(e.to_string()))?;

        if !response.status().is_success() {
            return Err(invalid_argument(format!(
                "origin responded {} for {}",
                response.status(),
                url
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Unknown(e.to_string()))?;

        if bytes.len() as u64 != length {
            return Err(invalid_argument(format!(
                "origin returned {} bytes, expected {}",
                bytes.len(),
                length
            )));
        }

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn downloads_a_byte_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(b"ello".to_vec())
                    .insert_header("content-range", "bytes 1-4/5"),
            )
            .mount(&server)
            .await;

        let backend = OriginBackend::new();
        let content = backend
            .download_piece(&format!("{}/file", server.uri()), 1, 4, HashMap::new())
            .await
            .unwrap();
        assert_eq!(content, b"ello");
    }

    #[tokio::test]
    async fn head_reports_content_length() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "5")
                    .insert_header("accept-ranges", "bytes"),
            )
            .mount(&server)
            .await;

        let backend = OriginBackend::new();
        let head = backend
            .head(&format!("{}/file", server.uri()), HashMap::new())
            .await
            .unwrap();
        assert_eq!(head.content_length, Some(5));
        assert!(head.supports_range);
    }
}

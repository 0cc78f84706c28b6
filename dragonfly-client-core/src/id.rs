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

use crate::error::{invalid_argument, Error};
use sha2::{Digest as Sha2Digest, Sha256};

/// task_id derives a stable TaskID from the URL and the metadata that
/// distinguishes otherwise-identical URLs (§4.1): the query params surviving
/// a filter list, a subset of headers, an optional tag/application, the
/// piece length and the optional content digest. The hash is SHA-256 hex,
/// the reference encoding for cross-implementation interoperability.
pub fn task_id(
    url: &str,
    digest: Option<&str>,
    tag: Option<&str>,
    application: Option<&str>,
    piece_length: Option<u64>,
    filtered_query_params: &[String],
) -> Result<String, Error> {
    let parsed = url::Url::parse(url)?;
    if parsed.scheme().is_empty() || parsed.host_str().is_none() {
        return Err(invalid_argument(format!("invalid url: {url}")));
    }

    let normalized_url = filter_query_params(&parsed, filtered_query_params);

    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());

    if let Some(tag) = tag {
        hasher.update(b"tag:");
        hasher.update(tag.as_bytes());
    }

    if let Some(application) = application {
        hasher.update(b"application:");
        hasher.update(application.as_bytes());
    }

    if let Some(piece_length) = piece_length {
        hasher.update(b"piece_length:");
        hasher.update(piece_length.to_string().as_bytes());
    }

    if let Some(digest) = digest {
        hasher.update(b"digest:");
        hasher.update(digest.as_bytes());
    }

    Ok(hex::encode(hasher.finalize()))
}

/// filter_query_params removes every query parameter named in `filtered`
/// and returns a canonical `scheme://host/path?sorted=query` string so that
/// two URLs differing only in filtered params (e.g. signed-URL tokens)
/// resolve to the same TaskID.
fn filter_query_params(url: &url::Url, filtered: &[String]) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !filtered.iter().any(|f| f == k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    let mut out = format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.path()
    );
    if !pairs.is_empty() {
        out.push('?');
        out.push_str(
            &pairs
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&"),
        );
    }
    out
}

/// host_id derives a stable HostID from the host's IP and hostname (§4.1).
pub fn host_id(ip: &str, hostname: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(b":");
    hasher.update(hostname.as_bytes());
    hex::encode(hasher.finalize())
}

/// peer_id derives a PeerID from the host id, a random suffix and a prefix
/// of the task id, so that a peer id alone hints at its originating host
/// and task without a lookup.
pub fn peer_id(host_id: &str, task_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let task_prefix = &task_id[..task_id.len().min(8)];
    format!("{host_id}-{suffix}-{task_prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_is_pure() {
        let a = task_id(
            "https://example.com/foo?a=1&sig=abc",
            None,
            Some("v1"),
            Some("app"),
            Some(4194304),
            &["sig".to_string()],
        )
        .unwrap();
        let b = task_id(
            "https://example.com/foo?a=1&sig=xyz",
            None,
            Some("v1"),
            Some("app"),
            Some(4194304),
            &["sig".to_string()],
        )
        .unwrap();
        assert_eq!(a, b, "filtered query params must not affect the task id");
    }

    #[test]
    fn task_id_differs_on_piece_length() {
        let a = task_id("https://example.com/foo", None, None, None, Some(1), &[]).unwrap();
        let b = task_id("https://example.com/foo", None, None, None, Some(2), &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn task_id_rejects_malformed_url() {
        assert!(task_id("not a url", None, None, None, None, &[]).is_err());
    }

    #[test]
    fn host_id_is_deterministic() {
        assert_eq!(
            host_id("10.0.0.1", "node-a"),
            host_id("10.0.0.1", "node-a")
        );
        assert_ne!(host_id("10.0.0.1", "node-a"), host_id("10.0.0.2", "node-a"));
    }

    #[test]
    fn peer_id_embeds_host_and_task_prefix() {
        let tid = task_id("https://example.com/foo", None, None, None, None, &[]).unwrap();
        let hid = host_id("10.0.0.1", "node-a");
        let pid = peer_id(&hid, &tid);
        assert!(pid.starts_with(&hid));
        assert!(pid.ends_with(&tid[..8]));
    }
}

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

use sha2::{Digest as Sha2Digest, Sha256};

/// sha256_hex computes the `sha256:<hex>` digest string Dragonfly uses to
/// tag both tasks and pieces (§3, §4.6 step 6).
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// verify returns true if `content`'s digest matches `expected`. A missing
/// `sha256:` prefix on `expected` is tolerated for interoperability with
/// implementations that store the bare hex digest.
pub fn verify(content: &[u8], expected: &str) -> bool {
    let actual = sha256_hex(content);
    actual == expected || actual.trim_start_matches("sha256:") == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_matching_digest() {
        let content = b"dragonfly";
        let digest = sha256_hex(content);
        assert!(verify(content, &digest));
    }

    #[test]
    fn rejects_mismatched_digest() {
        assert!(!verify(b"dragonfly", "sha256:deadbeef"));
    }

    #[test]
    fn tolerates_bare_hex_digest() {
        let content = b"dragonfly";
        let digest = sha256_hex(content);
        let bare = digest.trim_start_matches("sha256:");
        assert!(verify(content, bare));
    }
}

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

use dragonfly_client_core::{error::invalid_argument, Error};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::str::FromStr;

/// hashmap_to_headermap converts a plain string map (as carried over gRPC)
/// into an `http::HeaderMap`, rejecting any entry that isn't a valid header
/// name/value pair.
pub fn hashmap_to_headermap(header: &HashMap<String, String>) -> Result<HeaderMap, Error> {
    let mut header_map = HeaderMap::with_capacity(header.len());
    for (k, v) in header {
        let name = HeaderName::from_str(k)
            .map_err(|_| invalid_argument(format!("invalid header name: {k}")))?;
        let value = HeaderValue::from_str(v)
            .map_err(|_| invalid_argument(format!("invalid header value for {k}")))?;
        header_map.insert(name, value);
    }
    Ok(header_map)
}

/// headermap_to_hashmap is the inverse of `hashmap_to_headermap`, used when
/// the client needs to echo response headers back over gRPC.
pub fn headermap_to_hashmap(header: &HeaderMap) -> HashMap<String, String> {
    header
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect()
}

/// make_range_header builds a `Range: bytes=<offset>-<offset+length-1>` header
/// value for a piece download (spec §6, peer ↔ peer HTTP upload).
pub fn make_range_header(offset: u64, length: u64) -> String {
    format!("bytes={}-{}", offset, offset + length.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_valid_headers() {
        let mut map = HashMap::new();
        map.insert("X-Dragonfly-Tag".to_string(), "v1".to_string());
        let header_map = hashmap_to_headermap(&map).unwrap();
        assert_eq!(header_map.get("X-Dragonfly-Tag").unwrap(), "v1");
        let back = headermap_to_hashmap(&header_map);
        assert_eq!(back.get("X-Dragonfly-Tag").unwrap(), "v1");
    }

    #[test]
    fn rejects_invalid_header_name() {
        let mut map = HashMap::new();
        map.insert("bad header\n".to_string(), "v".to_string());
        assert!(hashmap_to_headermap(&map).is_err());
    }

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(make_range_header(0, 100), "bytes=0-99");
        assert_eq!(make_range_header(100, 50), "bytes=100-149");
    }
}

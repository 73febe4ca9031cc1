// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP authentication helpers
//!
//! Challenges are added to a [`Response`](crate::Response); credentials are read from a
//! [`Request`](crate::Request).

pub(crate) mod basic;
pub(crate) mod digest;
pub(crate) mod nonce;

pub use basic::BasicCredentials;
pub use digest::{DigestAlgorithm, DigestCheck, DigestParams};
pub use nonce::NonceBindType;

use crate::parser::h1::trim_ows;

/// Returns the credentials following `scheme` in an `Authorization` value, if the scheme
/// matches.
pub(crate) fn scheme_params<'a>(value: &'a [u8], scheme: &str) -> Option<&'a [u8]> {
    let value = trim_ows(value);
    let split = value
        .iter()
        .position(|&b| b == b' ' || b == b'\t')
        .unwrap_or(value.len());
    let (token, rest) = value.split_at(split);
    if token.eq_ignore_ascii_case(scheme.as_bytes()) {
        Some(trim_ows(rest))
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scheme_is_case_insensitive() {
        assert_eq!(Some(b"abc" as &[u8]), scheme_params(b"basic   abc", "Basic"));
        assert_eq!(None, scheme_params(b"Bearer abc", "Basic"));
        assert_eq!(None, scheme_params(b"Basicabc", "Basic"));
        assert_eq!(Some(b"" as &[u8]), scheme_params(b"Digest", "Digest"));
    }
}

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

//! `WWW-Authenticate` challenges

use super::{NonceSlot, Response};
use crate::auth::nonce::NONCE_LEN;
use crate::auth::DigestAlgorithm;
use crate::error::{Error, Result};
use crate::parser::StatusCode;

const CHALLENGE_HEADER: &str = "WWW-Authenticate";

/// Parameters of a Digest challenge. One challenge header is sent per algorithm.
#[derive(Debug, Clone, Default)]
pub struct DigestChallenge<'a> {
    /// Protection space shown to the user
    pub realm: &'a str,
    /// Opaque value the client must return unchanged
    pub opaque: Option<&'a str>,
    /// Space separated URIs of the protection space
    pub domain: Option<&'a str>,
    /// The previous request used an expired nonce; the credentials were otherwise right
    pub stale: bool,
    /// Offer `qop="auth"`
    pub qop_auth: bool,
    /// Algorithms to offer, in order of preference
    pub algorithms: &'a [DigestAlgorithm],
    /// Offer hashed user names
    pub userhash: bool,
    /// Ask the client to send UTF-8 user names and passwords
    pub prefer_utf8: bool,
}

impl Response {
    /// Adds a `WWW-Authenticate: Basic` challenge. The response status must be 401.
    pub fn add_auth_basic_challenge(&self, realm: &str, prefer_utf8: bool) -> Result<()> {
        if self.status() != StatusCode::UNAUTHORIZED {
            return Err(Error::RespHttpCodeNotSuitable);
        }
        check_param(realm)?;

        let mut value = String::with_capacity(realm.len() + 32);
        value.push_str("Basic realm=");
        push_quoted(&mut value, realm);
        if prefer_utf8 {
            value.push_str(", charset=\"UTF-8\"");
        }

        self.with_settings(|head| {
            if head.flags.has_bauth {
                return Err(Error::RespHeadersConflict);
            }
            head.flags.has_bauth = true;
            head.headers.push((CHALLENGE_HEADER.to_string(), value));
            Ok(())
        })
    }

    /// Adds `WWW-Authenticate: Digest` challenges. The response status must be 401.
    ///
    /// The nonce of every challenge is generated when the reply is sent, so a reusable response
    /// hands out a fresh nonce each time.
    pub fn add_auth_digest_challenge(&self, challenge: &DigestChallenge<'_>) -> Result<()> {
        if self.status() != StatusCode::UNAUTHORIZED {
            return Err(Error::RespHttpCodeNotSuitable);
        }
        if challenge.algorithms.is_empty() {
            return Err(Error::AuthDigestAlgoNotSupported);
        }
        check_param(challenge.realm)?;
        if let Some(opaque) = challenge.opaque {
            check_param(opaque)?;
        }
        if let Some(domain) = challenge.domain {
            check_param(domain)?;
        }

        let values: Vec<(String, usize)> = challenge
            .algorithms
            .iter()
            .map(|algo| digest_value(challenge, *algo))
            .collect();

        self.with_settings(|head| {
            if head.flags.has_dauth {
                return Err(Error::RespHeadersConflict);
            }
            head.flags.has_dauth = true;
            for (value, offset) in values {
                head.nonce_slots.push(NonceSlot {
                    header: head.headers.len(),
                    offset,
                });
                head.headers.push((CHALLENGE_HEADER.to_string(), value));
            }
            Ok(())
        })
    }
}

/// Formats one challenge and returns it with the offset of its nonce placeholder.
fn digest_value(challenge: &DigestChallenge<'_>, algo: DigestAlgorithm) -> (String, usize) {
    let mut value = String::with_capacity(160 + challenge.realm.len());
    value.push_str("Digest realm=");
    push_quoted(&mut value, challenge.realm);
    if challenge.qop_auth {
        value.push_str(", qop=\"auth\"");
    }
    value.push_str(", algorithm=");
    value.push_str(algo.token());
    value.push_str(", nonce=\"");
    let offset = value.len();
    value.extend(std::iter::repeat('0').take(NONCE_LEN));
    value.push('"');
    if let Some(opaque) = challenge.opaque {
        value.push_str(", opaque=");
        push_quoted(&mut value, opaque);
    }
    if let Some(domain) = challenge.domain {
        value.push_str(", domain=");
        push_quoted(&mut value, domain);
    }
    if challenge.stale {
        value.push_str(", stale=true");
    }
    if challenge.prefer_utf8 {
        value.push_str(", charset=UTF-8");
    }
    if challenge.userhash {
        value.push_str(", userhash=true");
    }
    (value, offset)
}

fn check_param(value: &str) -> Result<()> {
    if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(Error::RespHeaderValueInvalid);
    }
    Ok(())
}

fn push_quoted(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

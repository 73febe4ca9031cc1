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

//! Basic authentication (RFC 7617)

use base64ct::{Base64, Encoding};

use super::scheme_params;
use crate::error::{Error, Result};
use crate::mem::{MemoryPool, Span};

/// User name and password sent with the `Basic` scheme. Valid for the lifetime of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicCredentials<'a> {
    /// User name
    pub username: &'a str,
    /// Password, possibly empty
    pub password: &'a str,
}

/// Decoded credentials, stored in the connection pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BasicSpans {
    pub(crate) username: Span,
    pub(crate) password: Span,
}

/// Decodes the `Basic` credentials of an `Authorization` header value into `pool`.
pub(crate) fn decode(value: Option<&[u8]>, pool: &mut MemoryPool) -> Result<BasicSpans> {
    let token = value
        .and_then(|v| scheme_params(v, "Basic"))
        .ok_or(Error::AuthAbsent)?;
    if token.is_empty() {
        return Err(Error::ReqAuthDataBroken);
    }

    let decoded = Base64::decode_vec(
        std::str::from_utf8(token).map_err(|_| Error::ReqAuthDataBroken)?,
    )
    .map_err(|_| Error::ReqAuthDataBroken)?;
    if std::str::from_utf8(&decoded).is_err() {
        return Err(Error::ReqAuthDataBroken);
    }
    let colon = decoded
        .iter()
        .position(|&b| b == b':')
        .ok_or(Error::ReqAuthDataBroken)?;

    let username = pool
        .alloc_copy(&decoded[..colon])
        .ok_or(Error::ConnectionPoolNoMemAuthData)?;
    let password = pool
        .alloc_copy(&decoded[colon + 1..])
        .ok_or(Error::ConnectionPoolNoMemAuthData)?;
    Ok(BasicSpans { username, password })
}

impl BasicSpans {
    pub(crate) fn resolve<'a>(&self, pool: &'a MemoryPool) -> Result<BasicCredentials<'a>> {
        // the bytes were checked as UTF-8 before they were split at an ASCII colon
        match (pool.str(self.username), pool.str(self.password)) {
            (Some(username), Some(password)) => Ok(BasicCredentials { username, password }),
            _ => Err(Error::ReqAuthDataBroken),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_rfc_example() {
        let mut pool = MemoryPool::new(256);
        let spans = decode(Some(b"Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="), &mut pool).unwrap();
        let creds = spans.resolve(&pool).unwrap();
        assert_eq!("Aladdin", creds.username);
        assert_eq!("open sesame", creds.password);
    }

    #[test]
    fn password_may_contain_colons() {
        let mut pool = MemoryPool::new(256);
        // "u:p:q"
        let spans = decode(Some(b"Basic dTpwOnE="), &mut pool).unwrap();
        let creds = spans.resolve(&pool).unwrap();
        assert_eq!("u", creds.username);
        assert_eq!("p:q", creds.password);
    }

    #[test]
    fn absent_broken_and_no_memory() {
        let mut pool = MemoryPool::new(256);
        assert!(matches!(decode(None, &mut pool), Err(Error::AuthAbsent)));
        assert!(matches!(
            decode(Some(b"Bearer abc"), &mut pool),
            Err(Error::AuthAbsent)
        ));
        assert!(matches!(
            decode(Some(b"Basic !!!"), &mut pool),
            Err(Error::ReqAuthDataBroken)
        ));
        // "nocolon"
        assert!(matches!(
            decode(Some(b"Basic bm9jb2xvbg=="), &mut pool),
            Err(Error::ReqAuthDataBroken)
        ));

        let mut tiny = MemoryPool::new(4);
        assert!(matches!(
            decode(Some(b"Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="), &mut tiny),
            Err(Error::ConnectionPoolNoMemAuthData)
        ));
    }
}

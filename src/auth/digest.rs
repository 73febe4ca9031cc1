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

//! Digest authentication (RFC 7616)

use ring::digest;

use super::nonce::{NonceCheck, NonceStore};
use super::scheme_params;
use crate::error::{Error, Result};
use crate::parser::h1::tokens::is_tchar;

/// Hash algorithms of the Digest scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// `MD5`. Challenges can be sent, but responses cannot be verified.
    Md5,
    /// `SHA-256`
    Sha256,
    /// `SHA-512-256`
    Sha512_256,
}

impl DigestAlgorithm {
    /// Token used in the `algorithm` parameter.
    pub fn token(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha512_256 => "SHA-512-256",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        [Self::Md5, Self::Sha256, Self::Sha512_256]
            .into_iter()
            .find(|a| a.token().eq_ignore_ascii_case(token))
    }

    fn hash(&self) -> Result<&'static digest::Algorithm> {
        match self {
            DigestAlgorithm::Md5 => Err(Error::AuthDigestAlgoNotSupported),
            DigestAlgorithm::Sha256 => Ok(&digest::SHA256),
            DigestAlgorithm::Sha512_256 => Ok(&digest::SHA512_256),
        }
    }
}

/// Parameters of an `Authorization: Digest` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestParams {
    /// `username`, or the hashed user name when `userhash` is set
    pub username: Option<String>,
    /// `realm`
    pub realm: Option<String>,
    /// `nonce`
    pub nonce: Option<String>,
    /// `uri`
    pub uri: Option<String>,
    /// `response`
    pub response: Option<String>,
    /// `algorithm`; `MD5` when absent
    pub algorithm: Option<String>,
    /// `cnonce`
    pub cnonce: Option<String>,
    /// `nc`
    pub nc: Option<String>,
    /// `qop`
    pub qop: Option<String>,
    /// `opaque`
    pub opaque: Option<String>,
    /// `userhash`
    pub userhash: bool,
}

/// Result of checking Digest credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestCheck {
    /// The credentials are valid.
    Ok,
    /// The nonce expired or was replayed. Send a new challenge with `stale=true`.
    Stale,
    /// The nonce was not issued by this server for this request.
    WrongNonce,
    /// The user name does not match.
    WrongUsername,
    /// The realm does not match.
    WrongRealm,
    /// The `uri` parameter does not match the request target.
    WrongUri,
    /// The password is wrong.
    WrongResponse,
}

/// Parses the parameters of an `Authorization` header value with the `Digest` scheme.
pub(crate) fn parse(value: Option<&[u8]>) -> Result<DigestParams> {
    let params = value
        .and_then(|v| scheme_params(v, "Digest"))
        .ok_or(Error::AuthAbsent)?;
    let params = std::str::from_utf8(params).map_err(|_| Error::ReqAuthDataBroken)?;
    parse_params(params).ok_or(Error::ReqAuthDataBroken)
}

fn parse_params(mut input: &str) -> Option<DigestParams> {
    let mut out = DigestParams::default();
    loop {
        input = input.trim_start_matches([' ', '\t', ',']);
        if input.is_empty() {
            break;
        }

        let name_end = input.find(|c: char| !c.is_ascii() || !is_tchar(c as u8))?;
        let (name, rest) = input.split_at(name_end);
        if name.is_empty() {
            return None;
        }
        let rest = rest.trim_start_matches([' ', '\t']).strip_prefix('=')?;
        let rest = rest.trim_start_matches([' ', '\t']);

        let (value, rest) = if let Some(quoted) = rest.strip_prefix('"') {
            unquote(quoted)?
        } else {
            let end = rest
                .find(|c: char| !c.is_ascii() || !is_tchar(c as u8))
                .unwrap_or(rest.len());
            (rest[..end].to_string(), &rest[end..])
        };
        input = rest;

        let slot = match name.to_ascii_lowercase().as_str() {
            "username" => &mut out.username,
            "realm" => &mut out.realm,
            "nonce" => &mut out.nonce,
            "uri" => &mut out.uri,
            "response" => &mut out.response,
            "algorithm" => &mut out.algorithm,
            "cnonce" => &mut out.cnonce,
            "nc" => &mut out.nc,
            "qop" => &mut out.qop,
            "opaque" => &mut out.opaque,
            "userhash" => {
                out.userhash = value.eq_ignore_ascii_case("true");
                continue;
            }
            _ => continue,
        };
        if slot.is_some() {
            return None;
        }
        *slot = Some(value);
    }
    Some(out)
}

/// Reads a quoted-string after its opening quote.
fn unquote(input: &str) -> Option<(String, &str)> {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((value, &input[i + 1..])),
            '\\' => value.push(chars.next()?.1),
            _ => value.push(c),
        }
    }
    None
}

/// Request properties the credentials are checked against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DigestRequest<'a> {
    pub(crate) method: &'a str,
    pub(crate) target: &'a str,
    pub(crate) bind_key: u64,
}

/// Verifies `params` for a user with a known password.
pub(crate) fn check(
    params: &DigestParams,
    request: DigestRequest<'_>,
    nonces: &NonceStore,
    realm: &str,
    username: &str,
    password: &str,
) -> Result<DigestCheck> {
    let algo = match params.algorithm.as_deref() {
        None => DigestAlgorithm::Md5,
        Some(token) => DigestAlgorithm::from_token(token).ok_or(Error::AuthDigestAlgoNotSupported)?,
    };
    let hash = algo.hash()?;

    match params.qop.as_deref() {
        Some(qop) if qop.eq_ignore_ascii_case("auth") => {}
        _ => return Err(Error::AuthDigestQopNotSupported),
    }

    let (Some(client_user), Some(client_realm), Some(nonce), Some(uri), Some(response)) = (
        params.username.as_deref(),
        params.realm.as_deref(),
        params.nonce.as_deref(),
        params.uri.as_deref(),
        params.response.as_deref(),
    ) else {
        return Err(Error::ReqAuthDataBroken);
    };
    let (Some(cnonce), Some(nc)) = (params.cnonce.as_deref(), params.nc.as_deref()) else {
        return Err(Error::ReqAuthDataBroken);
    };
    let nc = u64::from_str_radix(nc, 16).map_err(|_| Error::ReqAuthDataBroken)?;

    if client_realm != realm {
        return Ok(DigestCheck::WrongRealm);
    }
    let expected_user = if params.userhash {
        hex_digest(hash, &[username.as_bytes(), realm.as_bytes()])
    } else {
        username.to_string()
    };
    let user_matches = if params.userhash {
        client_user.eq_ignore_ascii_case(&expected_user)
    } else {
        client_user == expected_user
    };
    if !user_matches {
        return Ok(DigestCheck::WrongUsername);
    }
    if uri != request.target {
        return Ok(DigestCheck::WrongUri);
    }

    let expected = response_digest(
        algo,
        &ResponseInput {
            username,
            realm,
            password,
            method: request.method,
            uri,
            nonce,
            nc: params.nc.as_deref().unwrap_or_default(),
            cnonce,
        },
    )?;
    if !constant_time_eq(expected.as_bytes(), response.to_ascii_lowercase().as_bytes()) {
        return Ok(DigestCheck::WrongResponse);
    }

    Ok(match nonces.check(nonce.as_bytes(), nc, request.bind_key) {
        NonceCheck::Valid => DigestCheck::Ok,
        NonceCheck::Stale => DigestCheck::Stale,
        NonceCheck::Wrong => DigestCheck::WrongNonce,
    })
}

struct ResponseInput<'a> {
    username: &'a str,
    realm: &'a str,
    password: &'a str,
    method: &'a str,
    uri: &'a str,
    nonce: &'a str,
    nc: &'a str,
    cnonce: &'a str,
}

/// `response` for `qop=auth`.
fn response_digest(algo: DigestAlgorithm, input: &ResponseInput<'_>) -> Result<String> {
    let hash = algo.hash()?;
    let ha1 = hex_digest(
        hash,
        &[
            input.username.as_bytes(),
            input.realm.as_bytes(),
            input.password.as_bytes(),
        ],
    );
    let ha2 = hex_digest(hash, &[input.method.as_bytes(), input.uri.as_bytes()]);
    Ok(hex_digest(
        hash,
        &[
            ha1.as_bytes(),
            input.nonce.as_bytes(),
            input.nc.as_bytes(),
            input.cnonce.as_bytes(),
            b"auth",
            ha2.as_bytes(),
        ],
    ))
}

/// Lower-case hex of the hash of `parts` joined with `:`.
fn hex_digest(algo: &'static digest::Algorithm, parts: &[&[u8]]) -> String {
    let mut ctx = digest::Context::new(algo);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            ctx.update(b":");
        }
        ctx.update(part);
    }
    ctx.finish()
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::nonce::{DEFAULT_MAX_NC, DEFAULT_NONCE_TIMEOUT};
    use crate::auth::NonceBindType;

    const RFC_RESPONSE_SHA256: &str =
        "753927fa0e85d155564e2e272a28d1802ca10daf4496794697cf8db5856cb6c1";

    fn rfc_input() -> ResponseInput<'static> {
        ResponseInput {
            username: "Mufasa",
            realm: "http-auth@example.org",
            password: "Circle of Life",
            method: "GET",
            uri: "/dir/index.html",
            nonce: "7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v",
            nc: "00000001",
            cnonce: "f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ",
        }
    }

    #[test]
    fn sha256_response_matches_rfc_example() {
        let digest = response_digest(DigestAlgorithm::Sha256, &rfc_input()).unwrap();
        assert_eq!(RFC_RESPONSE_SHA256, digest);
    }

    #[test]
    fn md5_is_not_supported() {
        assert!(matches!(
            response_digest(DigestAlgorithm::Md5, &rfc_input()),
            Err(Error::AuthDigestAlgoNotSupported)
        ));
    }

    #[test]
    fn parses_header_parameters() {
        let params = parse(Some(
            br#"Digest username="Mufasa", realm="http-auth@example.org", uri="/dir/index.html", algorithm=SHA-256, nonce="abc", nc=00000001, cnonce="x\"y", qop=auth, response="00", opaque="o", userhash=false"#,
        ))
        .unwrap();
        assert_eq!(Some("Mufasa"), params.username.as_deref());
        assert_eq!(Some("SHA-256"), params.algorithm.as_deref());
        assert_eq!(Some("x\"y"), params.cnonce.as_deref());
        assert_eq!(Some("00000001"), params.nc.as_deref());
        assert_eq!(Some("auth"), params.qop.as_deref());
        assert!(!params.userhash);
    }

    #[test]
    fn parse_rejects_broken_headers() {
        assert!(matches!(parse(None), Err(Error::AuthAbsent)));
        assert!(matches!(
            parse(Some(b"Basic abc")),
            Err(Error::AuthAbsent)
        ));
        assert!(matches!(
            parse(Some(br#"Digest realm="unterminated"#)),
            Err(Error::ReqAuthDataBroken)
        ));
        assert!(matches!(
            parse(Some(br#"Digest realm="a", realm="b""#)),
            Err(Error::ReqAuthDataBroken)
        ));
    }

    #[test]
    fn full_check_with_issued_nonce() {
        let store = NonceStore::new(
            8,
            DEFAULT_NONCE_TIMEOUT,
            DEFAULT_MAX_NC,
            NonceBindType::default(),
            Vec::new(),
        );
        let request = DigestRequest {
            method: "GET",
            target: "/secret",
            bind_key: store.bind_key(b"GET", b"/secret", None),
        };
        let nonce = store.generate(request.bind_key).unwrap();
        let nonce = std::str::from_utf8(&nonce).unwrap().to_string();

        let response = response_digest(
            DigestAlgorithm::Sha512_256,
            &ResponseInput {
                username: "user",
                realm: "r",
                password: "pw",
                method: "GET",
                uri: "/secret",
                nonce: &nonce,
                nc: "00000001",
                cnonce: "c",
            },
        )
        .unwrap();
        let params = DigestParams {
            username: Some("user".into()),
            realm: Some("r".into()),
            nonce: Some(nonce.clone()),
            uri: Some("/secret".into()),
            response: Some(response.to_uppercase()),
            algorithm: Some("SHA-512-256".into()),
            cnonce: Some("c".into()),
            nc: Some("00000001".into()),
            qop: Some("auth".into()),
            ..DigestParams::default()
        };

        assert_eq!(
            DigestCheck::WrongResponse,
            check(&params, request, &store, "r", "user", "bad").unwrap()
        );
        assert_eq!(
            DigestCheck::Ok,
            check(&params, request, &store, "r", "user", "pw").unwrap()
        );
        assert_eq!(
            DigestCheck::Stale,
            check(&params, request, &store, "r", "user", "pw").unwrap()
        );
        assert_eq!(
            DigestCheck::WrongRealm,
            check(&params, request, &store, "other", "user", "pw").unwrap()
        );
    }

    #[test]
    fn qop_must_be_auth() {
        let store = NonceStore::new(
            1,
            DEFAULT_NONCE_TIMEOUT,
            DEFAULT_MAX_NC,
            NonceBindType::default(),
            Vec::new(),
        );
        let params = DigestParams {
            algorithm: Some("SHA-256".into()),
            qop: Some("auth-int".into()),
            ..DigestParams::default()
        };
        let request = DigestRequest {
            method: "GET",
            target: "/",
            bind_key: 0,
        };
        assert!(matches!(
            check(&params, request, &store, "r", "u", "p"),
            Err(Error::AuthDigestQopNotSupported)
        ));
    }
}

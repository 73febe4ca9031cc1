//! Representation of HTTP method
use std::fmt::Display;

use super::h1::tokens::is_tchar;

/// Representation of the requested HTTP Method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
///
/// Methods that are not registered in RFC 9110 (or RFC 5789 for `PATCH`) are reported as
/// [`Method::Other`]; the request keeps the original token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.5
    Delete,
    /// RFC 9110 9.3.6
    Connect,
    /// RFC 9110 9.3.7
    Options,
    /// RFC 9110 9.3.8
    Trace,
    /// RFC 5789
    Patch,
    /// Any other token
    Other,
}

impl Method {
    /// Classifies a method token. Returns `None` if the token is empty or contains bytes that are
    /// not `tchar`.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        if token.is_empty() || !token.iter().all(|&b| is_tchar(b)) {
            return None;
        }

        Some(match token {
            b"GET" => Self::Get,
            b"HEAD" => Self::Head,
            b"POST" => Self::Post,
            b"PUT" => Self::Put,
            b"DELETE" => Self::Delete,
            b"CONNECT" => Self::Connect,
            b"OPTIONS" => Self::Options,
            b"TRACE" => Self::Trace,
            b"PATCH" => Self::Patch,
            _ => Self::Other,
        })
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
            Self::Other => "OTHER",
        })
    }
}

#[cfg(test)]
mod test {
    use super::Method;

    #[test]
    fn method_from_known_token() {
        assert_eq!(Some(Method::Get), Method::from_token(b"GET"));
        assert_eq!(Some(Method::Patch), Method::from_token(b"PATCH"));
    }

    #[test]
    fn method_tokens_are_case_sensitive() {
        assert_eq!(Some(Method::Other), Method::from_token(b"get"));
    }

    #[test]
    fn method_rejects_non_tokens() {
        assert_eq!(None, Method::from_token(b""));
        assert_eq!(None, Method::from_token(b"GE(T"));
    }
}

//! Byte classes from RFC 9110 Section 5.6 and RFC 9112

/// ```abnf
/// tchar = "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" / "-" / "." /
///         "^" / "_" / "`" / "|" / "~" / DIGIT / ALPHA
/// ```
#[inline]
pub fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// Visible ASCII characters, `VCHAR`.
#[inline]
pub fn is_vchar(b: u8) -> bool {
    (0x21..=0x7e).contains(&b)
}

/// `obs-text = %x80-FF`
#[inline]
pub fn is_obs_text(b: u8) -> bool {
    b >= 0x80
}

/// Bytes allowed inside a field value: `VCHAR / obs-text / SP / HTAB`.
#[inline]
pub fn is_field_value_byte(b: u8) -> bool {
    is_vchar(b) || is_obs_text(b) || b == b' ' || b == b'\t'
}

/// Bytes allowed in a field name when non-token names are tolerated: any visible ASCII except
/// the colon.
#[inline]
pub fn is_lenient_field_name_byte(b: u8) -> bool {
    is_vchar(b) && b != b':'
}

/// Bytes allowed in a request-target. Covers origin-form, absolute-form, authority-form and
/// asterisk-form; the precise form is left to the application.
#[inline]
pub fn is_request_target_token(b: u8) -> bool {
    is_vchar(b) || is_obs_text(b)
}

/// `OWS = *( SP / HTAB )`
#[inline]
pub fn is_ows(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tchar_excludes_separators() {
        for b in b"(),/:;<=>?@[\\]{}\" \t".iter() {
            assert!(!is_tchar(*b), "{} should not be a tchar", *b as char);
        }
        assert!(is_tchar(b'~'));
        assert!(is_tchar(b'Z'));
    }

    #[test]
    fn field_values_allow_obs_text_and_whitespace() {
        assert!(is_field_value_byte(0xe9));
        assert!(is_field_value_byte(b'\t'));
        assert!(!is_field_value_byte(b'\r'));
        assert!(!is_field_value_byte(0x7f));
    }
}

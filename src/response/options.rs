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

//! Response options

/// Options that change how a response is sent. All of them must be set before the response is
/// first used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOption {
    /// The response may be attached to many requests, concurrently.
    Reusable,
    /// Send headers only; the content is used for `Content-Length` but never sent.
    HeadOnly,
    /// Reply as an HTTP/1.0 server: `HTTP/1.0` status line, no chunking, connection closed after.
    Http10Mode,
    /// Close the connection after this reply.
    ForceClose,
    /// Use chunked encoding even when the size is known.
    ForceChunked,
    /// Do not send the automatic `Content-Length` header.
    SuppressContentLength,
    /// Allow the application to set `Content-Length` itself. The value is not checked.
    InsanityHeaderContentLength,
    /// Use the `ICY` status line of SHOUTcast servers. The daemon must enable SHOUTcast.
    ShoutcastIcy,
}

/// Configuration flags derived from options and headers when a response is frozen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Flags {
    pub(crate) reusable: bool,
    pub(crate) head_only: bool,
    pub(crate) chunked: bool,
    pub(crate) close_forced: bool,
    pub(crate) mode_1_0: bool,
    pub(crate) cnt_len_by_app: bool,
    pub(crate) suppress_content_length: bool,
    pub(crate) insanity_content_length: bool,
    pub(crate) has_hdr_date: bool,
    pub(crate) has_hdr_conn: bool,
    pub(crate) int_err_resp: bool,
    pub(crate) has_bauth: bool,
    pub(crate) has_dauth: bool,
    pub(crate) shoutcast: bool,
}

impl Flags {
    /// Folds `option` into the flags, returning a description of the conflict if it cannot be
    /// combined with the options already set.
    pub(crate) fn apply(&mut self, option: ResponseOption) -> Result<(), &'static str> {
        match option {
            ResponseOption::Reusable => self.reusable = true,
            ResponseOption::HeadOnly => self.head_only = true,
            ResponseOption::Http10Mode => {
                if self.chunked {
                    return Err("HTTP/1.0 mode cannot use chunked encoding");
                }
                self.mode_1_0 = true;
                self.close_forced = true;
            }
            ResponseOption::ForceClose => self.close_forced = true,
            ResponseOption::ForceChunked => {
                if self.mode_1_0 {
                    return Err("HTTP/1.0 mode cannot use chunked encoding");
                }
                self.chunked = true;
            }
            ResponseOption::SuppressContentLength => self.suppress_content_length = true,
            ResponseOption::InsanityHeaderContentLength => self.insanity_content_length = true,
            ResponseOption::ShoutcastIcy => self.shoutcast = true,
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn http_1_0_and_chunked_conflict() {
        let mut flags = Flags::default();
        flags.apply(ResponseOption::ForceChunked).unwrap();
        assert!(flags.apply(ResponseOption::Http10Mode).is_err());

        let mut flags = Flags::default();
        flags.apply(ResponseOption::Http10Mode).unwrap();
        assert!(flags.close_forced);
        assert!(flags.apply(ResponseOption::ForceChunked).is_err());
    }
}

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

//! `Date` header values, formatted at most once per second per thread.

use std::cell::RefCell;
use std::time::{SystemTime, UNIX_EPOCH};

struct CachedDate {
    second: u64,
    value: String,
}

thread_local! {
    static CACHE: RefCell<CachedDate> = RefCell::new(CachedDate {
        second: u64::MAX,
        value: String::new(),
    });
}

/// Calls `f` with the current time formatted as an IMF-fixdate.
pub fn with_http_date<R>(f: impl FnOnce(&str) -> R) -> R {
    let now = SystemTime::now();
    let second = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.second != second {
            cache.second = second;
            cache.value = httpdate::fmt_http_date(now);
        }
        f(&cache.value)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn date_is_imf_fixdate() {
        let value = with_http_date(|d| d.to_string());
        assert_eq!(29, value.len());
        assert!(value.ends_with(" GMT"));
        assert!(httpdate::parse_http_date(&value).is_ok());
    }
}

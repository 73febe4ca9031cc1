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

//! Process-wide handler for internal consistency failures.
//!
//! The server never aborts the process on its own. When a connection reaches a state that should
//! be impossible, the failure is reported here and the connection is closed with
//! [`CloseReason::IntError`](crate::CloseReason::IntError).

use std::sync::OnceLock;

/// Receives `(file, line, reason)` for every internal failure.
pub type PanicHandler = Box<dyn Fn(&'static str, u32, &str) + Send + Sync>;

static HANDLER: OnceLock<PanicHandler> = OnceLock::new();

/// Installs the handler. It can be set once per process, before any daemon starts; later calls
/// return the handler back.
pub fn set_panic_handler(handler: PanicHandler) -> Result<(), PanicHandler> {
    HANDLER.set(handler)
}

/// Reports an internal failure.
pub(crate) fn report(file: &'static str, line: u32, reason: &str) {
    match HANDLER.get() {
        Some(handler) => handler(file, line, reason),
        None => log::error!("internal error at {}:{}: {}", file, line, reason),
    }
}

macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::panic::report(file!(), line!(), &format!($($arg)*))
    };
}

pub(crate) use internal_error;

#[cfg(test)]
mod test {

    #[test]
    fn report_without_handler_does_not_abort() {
        internal_error!("stage {} is unexpected", 3);
    }
}

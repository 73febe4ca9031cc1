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

//! Answers every request with a greeting. `RUST_LOG=debug` shows the connection life cycle.
//!
//! ```text
//! cargo run --example hello -- 8080
//! curl -v http://localhost:8080/
//! ```

use std::sync::mpsc;

use hearth::daemon::AddressFamily;
use hearth::{DaemonBuilder, DaemonOption, Response, ResponseOption, WorkMode};

fn main() -> hearth::Result<()> {
    env_logger::init();

    let port = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(8080);

    let greeting = Response::from_buffer_static(200, b"Hello from hearth!\n")
        .expect("200 is a valid status");
    greeting.add_header("Content-Type", "text/plain; charset=utf-8")?;
    greeting.set_option(ResponseOption::Reusable)?;

    let daemon = DaemonBuilder::new(move |req| {
        log::info!("{} {}", req.method_str(), req.target());
        req.action_from_response(Some(greeting.clone()))
    })
    .option(DaemonOption::BindPort {
        family: AddressFamily::Auto,
        port,
    })?
    .option(DaemonOption::WorkMode(WorkMode::WorkerThreads(4)))?
    .start()?;

    log::info!("serving on port {}", port);
    let (_tx, rx) = mpsc::channel::<()>();
    // blocks until the process is interrupted
    let _ = rx.recv();
    daemon.destroy();
    Ok(())
}

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

//! Serves files below a directory, with optional Basic authentication.
//!
//! ```text
//! cargo run --example file_server -- ./public 8080 [user:password]
//! ```

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;

use hearth::daemon::AddressFamily;
use hearth::{Action, DaemonBuilder, DaemonOption, Method, Request, Response, WorkMode};

fn not_found(req: &mut Request<'_>) -> Option<Action> {
    req.action_from_response(Response::from_buffer_static(404, b"Not Found\n"))
}

/// Maps the request path below `root`, refusing anything that leaves it.
fn resolve(root: &Path, path: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if resolved.is_dir() {
        resolved.push("index.html");
    }
    Some(resolved)
}

fn serve(root: &Path, credentials: Option<&str>, req: &mut Request<'_>) -> Option<Action> {
    if let Some(expected) = credentials {
        let authorized = req
            .basic_auth()
            .map(|c| format!("{}:{}", c.username, c.password) == expected)
            .unwrap_or(false);
        if !authorized {
            let response = Response::from_buffer_static(401, b"Unauthorized\n")?;
            if response.add_auth_basic_challenge("files", true).is_err() {
                return req.action_from_response(None);
            }
            return req.action_from_response(Some(response));
        }
    }

    if !matches!(req.method(), Method::Get | Method::Head) {
        return req.action_from_response(Response::from_buffer_static(405, b"Method Not Allowed\n"));
    }
    let Some(path) = resolve(root, req.path()) else {
        return not_found(req);
    };
    let Ok(file) = File::open(&path) else {
        return not_found(req);
    };
    let Ok(len) = file.metadata().map(|m| m.len()) else {
        return not_found(req);
    };

    log::info!("{} -> {}", req.target(), path.display());
    req.action_from_response(Response::from_file(200, file, 0, len))
}

fn main() -> hearth::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let root = PathBuf::from(args.next().unwrap_or_else(|| ".".to_owned()));
    let port = args.next().and_then(|p| p.parse().ok()).unwrap_or(8080);
    let credentials = args.next();

    let daemon = DaemonBuilder::new(move |req| serve(&root, credentials.as_deref(), req))
        .option(DaemonOption::BindPort {
            family: AddressFamily::Auto,
            port,
        })?
        .option(DaemonOption::WorkMode(WorkMode::ThreadPerConnection))?
        .option(DaemonOption::DefaultTimeout(Duration::from_secs(30)))?
        .option(DaemonOption::PerIpLimit(16))?
        .start()?;

    log::info!("serving on port {}", port);
    loop {
        thread::sleep(Duration::from_secs(60));
        log::debug!("{:?}", daemon.info(hearth::InfoType::ConnectionCount)?);
    }
}

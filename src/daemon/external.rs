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

//! Driving connections from the application's event loop

use std::io::{self, ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use super::config::{Cookie, EventToken, RegisterCallback, WatchFor};
use super::event_loop::{
    accept_pending, admit, adopt_stream, wait_time, Command, ConnectionSet, Entry, LoopWaker,
    Wake, Watcher, LISTEN_TOKEN, WAKE_TOKEN,
};
use super::Shared;
use crate::connection::{Connection, EventLoopInfo};
use crate::error::{Error, Result};
use crate::net::IoWant;

/// Registration through the application's callback.
struct CallbackWatcher<'a> {
    register: &'a mut RegisterCallback,
    edge_triggered: bool,
}

/// What the application has to watch for `conn`.
fn direction(conn: &Connection) -> WatchFor {
    match conn.io_want() {
        IoWant::Read => return WatchFor::Recv,
        IoWant::Write => return WatchFor::Send,
        IoWant::None => {}
    }
    match conn.event() {
        EventLoopInfo::Recv => WatchFor::Recv,
        EventLoopInfo::Send => WatchFor::Send,
        EventLoopInfo::Block | EventLoopInfo::Cleanup => WatchFor::None,
    }
}

impl Watcher for CallbackWatcher<'_> {
    fn watch(&mut self, token: usize, entry: &mut Entry) -> io::Result<()> {
        let want = match direction(&entry.conn) {
            WatchFor::None => WatchFor::None,
            // an edge-triggered loop reports both directions once registered
            _ if self.edge_triggered => WatchFor::RecvSend,
            want => want,
        };
        if entry.watch == Some(want) {
            return Ok(());
        }
        if want == WatchFor::None {
            self.unwatch(token, entry);
            return Ok(());
        }

        match (self.register)(entry.conn.raw_fd(), want, entry.cookie, EventToken(token)) {
            Some(cookie) => {
                entry.cookie = Some(cookie);
                entry.watch = Some(want);
                Ok(())
            }
            None => Err(io::Error::new(
                ErrorKind::Other,
                "the application refused to watch the socket",
            )),
        }
    }

    fn unwatch(&mut self, token: usize, entry: &mut Entry) {
        if entry.watch.take().is_none() {
            return;
        }
        let cookie = entry.cookie.take();
        if (self.register)(entry.conn.raw_fd(), WatchFor::None, cookie, EventToken(token)).is_some()
        {
            log::error!("connection {}: {}", entry.conn.id(), Error::ExtrEventDeregFailed);
        }
    }
}

/// Connections served from readiness events the application reports.
pub(crate) struct ExternalLoop {
    shared: Arc<Shared>,
    register: RegisterCallback,
    edge_triggered: bool,
    listener: Option<(mio::net::TcpListener, Cookie)>,
    wake: Option<(UnixStream, Cookie)>,
    conns: ConnectionSet,
    commands: Receiver<Command>,
    stopped: bool,
}

impl std::fmt::Debug for ExternalLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalLoop")
            .field("edge_triggered", &self.edge_triggered)
            .field("listener", &self.listener)
            .field("conns", &self.conns.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

fn refused(what: &str) -> Error {
    Error::Io(io::Error::new(
        ErrorKind::Other,
        format!("the application refused to watch the {}", what),
    ))
}

impl ExternalLoop {
    pub(crate) fn new(
        shared: Arc<Shared>,
        listener: Option<std::net::TcpListener>,
        mut register: RegisterCallback,
        edge_triggered: bool,
    ) -> Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        let (sender, commands) = crossbeam_channel::unbounded();
        let handle = Arc::new(LoopWaker::new(Wake::Socket(wake_tx), sender));

        let wake_cookie = register(wake_rx.as_raw_fd(), WatchFor::Recv, None, EventToken(WAKE_TOKEN.0))
            .ok_or_else(|| refused("wake-up socket"))?;
        let listener = match listener {
            Some(listener) => {
                let cookie = register(
                    listener.as_raw_fd(),
                    WatchFor::Recv,
                    None,
                    EventToken(LISTEN_TOKEN.0),
                )
                .ok_or_else(|| refused("listening socket"))?;
                Some((mio::net::TcpListener::from_std(listener), cookie))
            }
            None => None,
        };

        Ok(ExternalLoop {
            conns: ConnectionSet::new(shared.clone(), handle),
            shared,
            register,
            edge_triggered,
            listener,
            wake: Some((wake_rx, wake_cookie)),
            commands,
            stopped: false,
        })
    }

    /// Handles readiness of the socket behind `token`. `WatchFor::None` reports an error
    /// condition on the socket.
    pub(crate) fn process_event(&mut self, token: EventToken, ready: WatchFor) {
        if self.stopped {
            return;
        }
        match token.0 {
            t if t == LISTEN_TOKEN.0 => self.accept(),
            t if t == WAKE_TOKEN.0 => self.run_commands(),
            t => {
                let mut watcher = CallbackWatcher {
                    register: &mut self.register,
                    edge_triggered: self.edge_triggered,
                };
                self.conns.on_ready(t, ready == WatchFor::None, &mut watcher);
            }
        }
    }

    /// Runs queued commands and closes timed out connections.
    pub(crate) fn process_pending(&mut self) {
        self.run_commands();
        if self.shared.stopping.load(Ordering::Acquire) {
            self.shutdown();
        }
        if !self.stopped {
            let mut watcher = CallbackWatcher {
                register: &mut self.register,
                edge_triggered: self.edge_triggered,
            };
            self.conns.sweep_timeouts(Instant::now(), &mut watcher);
        }
    }

    /// Time until the next connection timeout, at most `limit`.
    pub(crate) fn next_timeout(&self, limit: Option<Duration>) -> Option<Duration> {
        wait_time(self.conns.next_deadline(), limit)
    }

    pub(crate) fn add_stream(&mut self, stream: std::net::TcpStream) {
        match adopt_stream(stream) {
            Ok((stream, peer)) => {
                if let Some(admitted) = admit(&self.shared, stream, peer) {
                    let mut watcher = CallbackWatcher {
                        register: &mut self.register,
                        edge_triggered: self.edge_triggered,
                    };
                    self.conns.insert(admitted, &mut watcher);
                }
            }
            Err(err) => log::warn!("cannot serve added connection: {}", err),
        }
    }

    fn accept(&mut self) {
        let Some((listener, _)) = self.listener.as_ref() else {
            return;
        };
        let mut watcher = CallbackWatcher {
            register: &mut self.register,
            edge_triggered: self.edge_triggered,
        };
        let conns = &mut self.conns;
        accept_pending(&self.shared, listener, |admitted| {
            conns.insert(admitted, &mut watcher)
        });
    }

    fn run_commands(&mut self) {
        if let Some((wake, _)) = self.wake.as_mut() {
            let mut buf = [0u8; 64];
            loop {
                match wake.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        }

        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Resume { token, id } => {
                    let mut watcher = CallbackWatcher {
                        register: &mut self.register,
                        edge_triggered: self.edge_triggered,
                    };
                    self.conns.resume(token, id, &mut watcher);
                }
                Command::Add(stream) => self.add_stream(stream),
                Command::Shutdown => self.shutdown(),
            }
        }
    }

    /// Closes every connection and removes all sockets from the application's loop.
    pub(crate) fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let mut watcher = CallbackWatcher {
            register: &mut self.register,
            edge_triggered: self.edge_triggered,
        };
        self.conns.terminate_all(&mut watcher);

        let listener = self.listener.take();
        let wake = self.wake.take();
        let sockets = listener
            .iter()
            .map(|(listener, cookie)| (listener.as_raw_fd(), *cookie, LISTEN_TOKEN))
            .chain(wake.iter().map(|(wake, cookie)| (wake.as_raw_fd(), *cookie, WAKE_TOKEN)));
        for (fd, cookie, token) in sockets {
            if (self.register)(fd, WatchFor::None, Some(cookie), EventToken(token.0)).is_some() {
                log::error!("{}", Error::ExtrEventDeregFailed);
            }
        }
        log::debug!("external event processing stopped");
    }
}

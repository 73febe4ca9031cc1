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

//! Daemon threads
//!
//! Worker threads each run their own [`EventLoop`] and accept from a clone of the listening
//! socket. In thread-per-connection mode one accepting loop hands every admitted stream to a new
//! thread that runs a loop for that stream alone.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::event_loop::{Admitted, Command, EventLoop, LoopWaker};
use super::Shared;
use crate::error::{Error, Result};

/// A thread running an event loop.
#[derive(Debug)]
pub(crate) struct LoopThread {
    handle: Arc<LoopWaker>,
    join: JoinHandle<()>,
}

impl LoopThread {
    pub(crate) fn send(&self, command: Command) -> io::Result<()> {
        self.handle.send(command)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Asks the loop to shut down and waits for the thread.
    pub(crate) fn stop(self) {
        if let Err(err) = self.handle.send(Command::Shutdown) {
            log::trace!("event loop already gone: {}", err);
        }
        if self.join.join().is_err() {
            log::error!("event loop thread panicked");
        }
    }
}

fn builder(shared: &Shared, name: String) -> thread::Builder {
    let builder = thread::Builder::new().name(name);
    match shared.config.stack_size {
        Some(size) => builder.stack_size(size),
        None => builder,
    }
}

/// Runs `event_loop` on a new thread, serving `first` before anything else.
fn spawn_loop(
    shared: &Shared,
    name: String,
    mut event_loop: EventLoop,
    first: Option<Admitted>,
) -> io::Result<LoopThread> {
    let handle = event_loop.handle();
    let join = builder(shared, name).spawn(move || {
        if let Some(admitted) = first {
            event_loop.serve(admitted);
        }
        event_loop.run();
    })?;
    Ok(LoopThread { handle, join })
}

/// Starts `n` worker threads sharing `listener`.
pub(crate) fn spawn_workers(
    shared: &Arc<Shared>,
    listener: Option<&std::net::TcpListener>,
    n: usize,
) -> Result<Vec<LoopThread>> {
    let mut workers: Vec<LoopThread> = Vec::with_capacity(n);
    for i in 0..n {
        let started = listener
            .map(|l| l.try_clone())
            .transpose()
            .and_then(|listener| EventLoop::new(shared.clone(), listener))
            .map_err(Error::Io)
            .and_then(|event_loop| {
                spawn_loop(shared, format!("hearth-worker-{}", i), event_loop, None)
                    .map_err(Error::ThreadLaunch)
            });
        match started {
            Ok(worker) => workers.push(worker),
            Err(err) => {
                workers.into_iter().for_each(LoopThread::stop);
                return Err(err);
            }
        }
    }
    log::debug!("started {} worker threads", n);
    Ok(workers)
}

/// Starts the accepting thread of the thread-per-connection mode.
pub(crate) fn spawn_acceptor(
    shared: &Arc<Shared>,
    listener: std::net::TcpListener,
) -> Result<LoopThread> {
    let event_loop =
        EventLoop::new(shared.clone(), Some(listener))?.with_spawner(Spawner::new(shared.clone()));
    spawn_loop(shared, "hearth-accept".to_owned(), event_loop, None).map_err(Error::ThreadLaunch)
}

/// Starts a thread for every admitted connection and keeps track of them.
#[derive(Debug)]
pub(crate) struct Spawner {
    shared: Arc<Shared>,
    threads: Vec<LoopThread>,
}

impl Spawner {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Spawner {
            shared,
            threads: Vec::new(),
        }
    }

    pub(crate) fn spawn(&mut self, admitted: Admitted) {
        self.threads.retain(|thread| !thread.is_finished());

        let event_loop = match EventLoop::new(self.shared.clone(), None) {
            Ok(event_loop) => event_loop.exit_when_idle(),
            Err(err) => {
                log::error!("cannot create connection event loop: {}", err);
                return;
            }
        };
        let name = format!("hearth-conn-{}", self.threads.len());
        match spawn_loop(&self.shared, name, event_loop, Some(admitted)) {
            Ok(thread) => self.threads.push(thread),
            Err(err) => log::error!("cannot start connection thread: {}", err),
        }
    }

    pub(crate) fn join_all(&mut self) {
        self.threads.drain(..).for_each(LoopThread::stop);
    }
}

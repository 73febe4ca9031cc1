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

//! Event loops driving connections
//!
//! A [`ConnectionSet`] owns the connections of one thread and knows how to move them along;
//! where readiness comes from is abstracted by [`Watcher`]. [`EventLoop`] is the `mio` based
//! driver used by the internal work modes and by the externally polled modes.

use std::io::{self, ErrorKind, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;

use super::config::{ConnectionNotice, Cookie, WatchFor};
use super::limits::Admission;
use super::worker::Spawner;
use super::Shared;
use crate::connection::{
    CloseReason, ConnContext, Connection, ConnectionBuilder, LoopHandle, Outcome,
};
use crate::net::tcp_listener::TcpListener;

pub(crate) const LISTEN_TOKEN: Token = Token(usize::MAX);
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX - 1);

const EVENTS_CAPACITY: usize = 1024;

/// Requests sent to an event loop from other threads.
#[derive(Debug)]
pub(crate) enum Command {
    /// Resume a suspended connection.
    Resume { token: usize, id: u64 },
    /// Serve a stream accepted by the application.
    Add(std::net::TcpStream),
    /// Close everything and stop.
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Wake {
    Mio(mio::Waker),
    /// Write end of a socket pair the application watches.
    Socket(UnixStream),
}

/// Queues commands for an event loop and wakes it.
#[derive(Debug)]
pub(crate) struct LoopWaker {
    wake: Wake,
    commands: Sender<Command>,
}

impl LoopWaker {
    pub(crate) fn new(wake: Wake, commands: Sender<Command>) -> Self {
        LoopWaker { wake, commands }
    }

    pub(crate) fn send(&self, command: Command) -> io::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "event loop has stopped"))?;
        match &self.wake {
            Wake::Mio(waker) => waker.wake(),
            Wake::Socket(stream) => {
                let mut stream: &UnixStream = stream;
                match stream.write(&[1]) {
                    Ok(_) => Ok(()),
                    // a full socket already wakes the loop
                    Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(()),
                    Err(err) => Err(err),
                }
            }
        }
    }
}

impl LoopHandle for LoopWaker {
    fn resume(&self, token: usize, id: u64) {
        if let Err(err) = self.send(Command::Resume { token, id }) {
            log::debug!("cannot resume connection {}: {}", id, err);
        }
    }
}

/// A stream that passed the accept checks.
#[derive(Debug)]
pub(crate) struct Admitted {
    stream: mio::net::TcpStream,
    peer: Option<SocketAddr>,
    admission: Admission,
}

/// Applies the daemon's accept checks to a new stream.
pub(crate) fn admit(
    shared: &Arc<Shared>,
    stream: mio::net::TcpStream,
    peer: Option<SocketAddr>,
) -> Option<Admitted> {
    let config = &shared.config;
    if shared.stopping.load(Ordering::Acquire) {
        return None;
    }
    if let Some(limit) = config.fd_number_limit {
        let fd = stream.as_raw_fd();
        if fd < 0 || fd as usize >= limit {
            log::warn!("descriptor {} is above the limit of {}, dropping connection", fd, limit);
            return None;
        }
    }
    if !config.turbo {
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => {
                log::debug!("accepted socket from {:?} has failed: {}", peer, err);
                return None;
            }
        }
    }
    if let (Some(policy), Some(addr)) = (&config.accept_policy, peer) {
        if !policy(&addr) {
            log::debug!("connection from {} refused by accept policy", addr);
            return None;
        }
    }
    let admission = shared.limits.admit(peer.map(|addr| addr.ip()))?;

    Some(Admitted {
        stream,
        peer,
        admission,
    })
}

/// Accepts until the listener would block and passes on every admitted stream.
pub(crate) fn accept_pending<L>(shared: &Arc<Shared>, listener: &L, mut serve: impl FnMut(Admitted))
where
    L: TcpListener<mio::net::TcpStream>,
{
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Some(admitted) = admit(shared, stream, Some(peer)) {
                    serve(admitted);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                let pending = listener.take_error().ok().flatten();
                log::warn!("accept failed: {}, pending socket error: {:?}", err, pending);
                break;
            }
        }
    }
}

/// Prepares a stream handed over by the application.
pub(crate) fn adopt_stream(
    stream: std::net::TcpStream,
) -> io::Result<(mio::net::TcpStream, Option<SocketAddr>)> {
    stream.set_nonblocking(true)?;
    let peer = stream.peer_addr().ok();
    Ok((mio::net::TcpStream::from_std(stream), peer))
}

/// A connection and its bookkeeping.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) conn: Connection,
    /// Directions the event source watches, `None` when it does not know the socket.
    pub(crate) watch: Option<WatchFor>,
    pub(crate) cookie: Option<Cookie>,
    _admission: Admission,
}

/// Source of readiness events for connection sockets.
pub(crate) trait Watcher {
    /// Makes sure the socket is watched for what the connection waits for.
    fn watch(&mut self, token: usize, entry: &mut Entry) -> io::Result<()>;

    /// Stops watching before the connection is dropped or handed over.
    fn unwatch(&mut self, token: usize, entry: &mut Entry);
}

/// Edge-triggered registration with a `mio` poller. Sockets are registered for both
/// directions while the connection runs and dropped from the poller while it is suspended.
pub(crate) struct MioWatcher<'r> {
    registry: &'r Registry,
}

impl<'r> MioWatcher<'r> {
    pub(crate) fn new(registry: &'r Registry) -> Self {
        MioWatcher { registry }
    }
}

impl Watcher for MioWatcher<'_> {
    fn watch(&mut self, token: usize, entry: &mut Entry) -> io::Result<()> {
        if entry.conn.is_suspended() {
            // registering again on resume reports the current readiness
            self.unwatch(token, entry);
        } else if entry.watch.is_none() {
            entry.conn.register(self.registry, Token(token))?;
            entry.watch = Some(WatchFor::RecvSend);
        }
        Ok(())
    }

    fn unwatch(&mut self, _: usize, entry: &mut Entry) {
        if entry.watch.take().is_some() {
            if let Err(err) = entry.conn.deregister(self.registry) {
                log::debug!("connection {}: deregister failed: {}", entry.conn.id(), err);
            }
        }
    }
}

/// The connections owned by one thread.
#[derive(Debug)]
pub(crate) struct ConnectionSet {
    shared: Arc<Shared>,
    loop_handle: Arc<dyn LoopHandle>,
    entries: Slab<Entry>,
}

impl ConnectionSet {
    pub(crate) fn new(shared: Arc<Shared>, loop_handle: Arc<dyn LoopHandle>) -> Self {
        ConnectionSet {
            shared,
            loop_handle,
            entries: Slab::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Starts serving an admitted stream.
    pub(crate) fn insert(&mut self, admitted: Admitted, watcher: &mut dyn Watcher) {
        let Admitted {
            stream,
            peer,
            admission,
        } = admitted;

        let tls = self.shared.config.tls.clone();
        let is_tls = tls.is_some();
        let builder = match tls {
            Some(tls) => match ConnectionBuilder::with_tls(stream, peer, tls) {
                Ok(builder) => builder,
                Err(err) => {
                    log::warn!("cannot start TLS session with {:?}: {}", peer, err);
                    return;
                }
            },
            None => ConnectionBuilder::with_plaintext(stream, peer),
        };

        let vacant = self.entries.vacant_entry();
        let token = vacant.key();
        let id = self.shared.next_connection_id();
        let ctx = ConnContext {
            shared: self.shared.clone(),
            peer,
            is_tls,
            token,
            id,
            loop_handle: self.loop_handle.clone(),
        };
        vacant.insert(Entry {
            conn: builder.build(ctx),
            watch: None,
            cookie: None,
            _admission: admission,
        });
        log::debug!("connection {} accepted from {:?}", id, peer);
        self.shared.notify(ConnectionNotice::Started(peer));

        self.drive(token, watcher);
    }

    /// Processes a connection and updates what is watched for it.
    pub(crate) fn drive(&mut self, token: usize, watcher: &mut dyn Watcher) {
        let Some(entry) = self.entries.get_mut(token) else {
            return;
        };
        match entry.conn.process() {
            Outcome::Open(_) => {
                if let Err(err) = watcher.watch(token, entry) {
                    log::error!("connection {}: cannot watch socket: {}", entry.conn.id(), err);
                    let reason = entry.conn.close(CloseReason::SocketErr);
                    self.remove(token, reason, watcher);
                }
            }
            Outcome::Closed(reason) => self.remove(token, reason, watcher),
            Outcome::Upgrade => {
                if let Some(mut entry) = self.entries.try_remove(token) {
                    watcher.unwatch(token, &mut entry);
                    log::debug!("connection {} upgraded", entry.conn.id());
                    entry.conn.finish_upgrade();
                }
            }
        }
    }

    /// Handles readiness reported for a connection socket.
    pub(crate) fn on_ready(&mut self, token: usize, error: bool, watcher: &mut dyn Watcher) {
        if let Some(entry) = self.entries.get_mut(token) {
            if error {
                entry.conn.check_socket_error();
            }
            self.drive(token, watcher);
        }
    }

    /// Resumes connection `token` if it is still the connection with `id`.
    pub(crate) fn resume(&mut self, token: usize, id: u64, watcher: &mut dyn Watcher) {
        match self.entries.get_mut(token) {
            Some(entry) if entry.conn.id() == id && entry.conn.is_suspended() => {
                entry.conn.resume();
                self.drive(token, watcher);
            }
            _ => log::trace!("resume of gone connection {} ignored", id),
        }
    }

    /// Closes connections idle past their timeout.
    pub(crate) fn sweep_timeouts(&mut self, now: Instant, watcher: &mut dyn Watcher) {
        let expired: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.conn.timed_out(now))
            .map(|(token, _)| token)
            .collect();

        for token in expired {
            if let Some(entry) = self.entries.get_mut(token) {
                log::debug!("connection {} timed out", entry.conn.id());
                let reason = entry.conn.close(CloseReason::TimeoutReached);
                self.remove(token, reason, watcher);
            }
        }
    }

    /// The earliest connection timeout.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|(_, entry)| entry.conn.deadline())
            .min()
    }

    /// Closes every connection for shutdown.
    pub(crate) fn terminate_all(&mut self, watcher: &mut dyn Watcher) {
        let tokens: Vec<usize> = self.entries.iter().map(|(token, _)| token).collect();
        for token in tokens {
            if let Some(entry) = self.entries.get_mut(token) {
                let reason = entry.conn.terminate();
                self.remove(token, reason, watcher);
            }
        }
    }

    fn remove(&mut self, token: usize, reason: CloseReason, watcher: &mut dyn Watcher) {
        if let Some(mut entry) = self.entries.try_remove(token) {
            watcher.unwatch(token, &mut entry);
            self.shared
                .notify(ConnectionNotice::Closed(entry.conn.peer_addr(), reason));
        }
    }
}

/// Time until `deadline`, bounded by `limit`.
pub(crate) fn wait_time(deadline: Option<Instant>, limit: Option<Duration>) -> Option<Duration> {
    let until = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    match (until, limit) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// A `mio` event loop over a listening socket, a waker and a set of connections.
#[derive(Debug)]
pub(crate) struct EventLoop {
    shared: Arc<Shared>,
    poll: Poll,
    events: Events,
    listener: Option<mio::net::TcpListener>,
    conns: ConnectionSet,
    commands: Receiver<Command>,
    handle: Arc<LoopWaker>,
    spawner: Option<Spawner>,
    exit_when_idle: bool,
    stopped: bool,
}

impl EventLoop {
    pub(crate) fn new(
        shared: Arc<Shared>,
        listener: Option<std::net::TcpListener>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (sender, commands) = crossbeam_channel::unbounded();
        let handle = Arc::new(LoopWaker::new(Wake::Mio(waker), sender));

        let mut listener = listener.map(mio::net::TcpListener::from_std);
        if let Some(listener) = listener.as_mut() {
            poll.registry()
                .register(listener, LISTEN_TOKEN, Interest::READABLE)?;
        }
        let conns = ConnectionSet::new(shared.clone(), handle.clone());

        Ok(EventLoop {
            shared,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            conns,
            commands,
            handle,
            spawner: None,
            exit_when_idle: false,
            stopped: false,
        })
    }

    /// Hands accepted connections to threads of their own instead of serving them.
    pub(crate) fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Stops the loop once its last connection is gone.
    pub(crate) fn exit_when_idle(mut self) -> Self {
        self.exit_when_idle = true;
        self
    }

    pub(crate) fn handle(&self) -> Arc<LoopWaker> {
        self.handle.clone()
    }

    /// Descriptor that becomes readable when the loop has work.
    pub(crate) fn poll_fd(&self) -> RawFd {
        self.poll.as_raw_fd()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.conns.next_deadline()
    }

    /// Serves an admitted stream on this loop or on a thread of its own.
    pub(crate) fn serve(&mut self, admitted: Admitted) {
        match self.spawner.as_mut() {
            Some(spawner) => spawner.spawn(admitted),
            None => {
                let mut watcher = MioWatcher::new(self.poll.registry());
                self.conns.insert(admitted, &mut watcher);
            }
        }
    }

    /// Serves a stream accepted by the application.
    pub(crate) fn add_stream(&mut self, stream: std::net::TcpStream) {
        match adopt_stream(stream) {
            Ok((stream, peer)) => {
                if let Some(admitted) = admit(&self.shared, stream, peer) {
                    self.serve(admitted);
                }
            }
            Err(err) => log::warn!("cannot serve added connection: {}", err),
        }
    }

    /// Runs until shutdown.
    pub(crate) fn run(mut self) {
        loop {
            match self.run_once(None) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    log::error!("polling failed: {}", err);
                    self.shutdown();
                    break;
                }
            }
        }
    }

    /// Waits at most `timeout` for events and handles them. Returns `false` once the loop has
    /// stopped.
    pub(crate) fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        if self.stopped || (self.exit_when_idle && self.conns.is_empty()) {
            return Ok(false);
        }

        let timeout = wait_time(self.conns.next_deadline(), timeout);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let ready: Vec<(Token, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_error()))
            .collect();
        for (token, error) in ready {
            match token {
                LISTEN_TOKEN => self.accept(),
                WAKE_TOKEN => {}
                Token(token) => {
                    let mut watcher = MioWatcher::new(self.poll.registry());
                    self.conns.on_ready(token, error, &mut watcher);
                }
            }
        }

        self.run_commands();
        if self.shared.stopping.load(Ordering::Acquire) {
            self.shutdown();
        }
        if !self.stopped {
            let mut watcher = MioWatcher::new(self.poll.registry());
            self.conns.sweep_timeouts(Instant::now(), &mut watcher);
        }

        Ok(!self.stopped && !(self.exit_when_idle && self.conns.is_empty()))
    }

    fn accept(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        accept_pending(&shared, &listener, |admitted| self.serve(admitted));
        self.listener = Some(listener);
    }

    fn run_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Resume { token, id } => {
                    let mut watcher = MioWatcher::new(self.poll.registry());
                    self.conns.resume(token, id, &mut watcher);
                }
                Command::Add(stream) => self.add_stream(stream),
                Command::Shutdown => self.shutdown(),
            }
        }
    }

    /// Stops accepting, closes every connection and joins connection threads.
    pub(crate) fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        let mut watcher = MioWatcher::new(self.poll.registry());
        self.conns.terminate_all(&mut watcher);
        if let Some(mut spawner) = self.spawner.take() {
            spawner.join_all();
        }
        log::debug!("event loop stopped");
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::action::Action;
    use crate::daemon::config::DaemonConfig;
    use crate::request::Request;
    use crate::response::Response;

    #[derive(Debug)]
    struct NoopLoop;

    impl LoopHandle for NoopLoop {
        fn resume(&self, _: usize, _: u64) {}
    }

    fn suspend_once(calls: Arc<AtomicUsize>) -> impl Fn(&mut Request<'_>) -> Option<Action> {
        move |req: &mut Request<'_>| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                req.action_suspend()
            } else {
                req.action_from_response(Response::from_buffer_static(200, b"hi"))
            }
        }
    }

    #[test]
    fn suspended_connection_leaves_the_poller_until_resumed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(Shared::new(
            DaemonConfig::default(),
            Box::new(suspend_once(calls.clone())),
        ));
        let mut set = ConnectionSet::new(shared.clone(), Arc::new(NoopLoop));
        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(8);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let admitted = Admitted {
            stream: mio::net::TcpStream::from_std(stream),
            peer: Some(peer),
            admission: shared.limits.admit(Some(peer.ip())).unwrap(),
        };

        set.insert(admitted, &mut MioWatcher::new(poll.registry()));
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
            for event in events.iter() {
                set.on_ready(event.token().0, false, &mut MioWatcher::new(poll.registry()));
            }
        }

        let (token, entry) = set.entries.iter().next().unwrap();
        assert!(entry.conn.is_suspended());
        assert_eq!(None, entry.watch);
        let id = entry.conn.id();

        set.resume(token, id, &mut MioWatcher::new(poll.registry()));
        let entry = &set.entries[token];
        assert!(!entry.conn.is_suspended());
        assert_eq!(Some(WatchFor::RecvSend), entry.watch);
        assert_eq!(2, calls.load(Ordering::SeqCst));
    }
}

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

//! The daemon: listening, scheduling and shared state
//!
//! A [`Daemon`] is configured through [`DaemonBuilder`] and runs in one of the [`WorkMode`]s.
//! The internal modes run their own threads; the external modes are driven by the application
//! through [`Daemon::run_wait`], or through [`Daemon::process_external_event`] and
//! [`Daemon::process_pending`].
//!
//! ```no_run
//! use hearth::{DaemonBuilder, DaemonOption, Response};
//!
//! let daemon = DaemonBuilder::new(|req| {
//!     req.action_from_response(Response::from_buffer_static(200, b"hello"))
//! })
//! .option(DaemonOption::BindSocketAddr {
//!     addr: "127.0.0.1:8080".parse().unwrap(),
//!     dual_stack: None,
//! })
//! .unwrap()
//! .start()
//! .unwrap();
//! # drop(daemon);
//! ```

use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::server::WebPkiClientVerifier;
use rustls::ServerConfig;

use crate::action::Action;
use crate::auth::nonce::NonceStore;
use crate::error::{Error, Result};
use crate::net::tcp_listener::{self, ListenOptions};
use crate::request::Request;

pub(crate) mod config;
mod event_loop;
mod external;
mod limits;
mod worker;

pub use config::{
    AcceptPolicy, AddressFamily, ConnectionNotice, Cookie, DaemonOption, EarlyUriLogger,
    EventToken, FastOpenMode, NotifyCallback, PollSyscall, ReadyCallback, RegisterCallback,
    WatchFor, WorkMode, DEFAULT_CONN_MEMORY_LIMIT, DEFAULT_LARGE_POOL_SIZE,
};

use config::{Bind, DaemonConfig};
use event_loop::{wait_time, Command, EventLoop};
use external::ExternalLoop;
use limits::Limits;
use worker::LoopThread;

/// Application callback producing the action for a request.
pub type RequestHandler = Box<dyn Fn(&mut Request<'_>) -> Option<Action> + Send + Sync>;

/// State shared by every thread and connection of a daemon.
pub(crate) struct Shared {
    pub(crate) config: DaemonConfig,
    pub(crate) handler: RequestHandler,
    pub(crate) nonces: NonceStore,
    pub(crate) limits: Arc<Limits>,
    pub(crate) stopping: AtomicBool,
    large_pool_used: AtomicUsize,
    next_conn_id: AtomicU64,
}

impl Shared {
    pub(crate) fn new(config: DaemonConfig, handler: RequestHandler) -> Self {
        let nonces = NonceStore::new(
            config.dauth_map_size,
            config.dauth_nonce_timeout,
            config.dauth_max_nc,
            config.dauth_bind,
            config.random_entropy.clone(),
        );
        let limits = Arc::new(Limits::new(
            config.global_connection_limit,
            config.per_ip_limit,
        ));
        Shared {
            config,
            handler,
            nonces,
            limits,
            stopping: AtomicBool::new(false),
            large_pool_used: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Charges `n` bytes to the large buffer budget.
    pub(crate) fn take_large(&self, n: usize) -> bool {
        let limit = self.config.large_pool_size;
        self.large_pool_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(n).filter(|&total| total <= limit)
            })
            .is_ok()
    }

    pub(crate) fn release_large(&self, n: usize) {
        self.large_pool_used.fetch_sub(n, Ordering::AcqRel);
    }

    /// True if `n` more bytes currently fit the large buffer budget.
    pub(crate) fn large_available(&self, n: usize) -> bool {
        self.large_pool_used.load(Ordering::Acquire).saturating_add(n)
            <= self.config.large_pool_size
    }

    /// HTTP/1 carries one stream per connection, so both callbacks see the same events.
    pub(crate) fn notify(&self, notice: ConnectionNotice) {
        if let Some(cb) = &self.config.notify_connection {
            cb(notice);
        }
        if let Some(cb) = &self.config.notify_stream {
            cb(notice);
        }
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .field("stopping", &self.stopping)
            .field("large_pool_used", &self.large_pool_used)
            .finish_non_exhaustive()
    }
}

/// Information [`Daemon::info`] can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoType {
    /// Port of the listening socket
    BindPort,
    /// Descriptor of the listening socket
    ListenFd,
    /// Descriptor to watch in [`WorkMode::ExternalSingleFdWatch`]
    PollFd,
    /// Number of open connections
    ConnectionCount,
}

/// Answer of [`Daemon::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonInfo {
    /// A port
    Port(u16),
    /// A descriptor
    Fd(RawFd),
    /// A count
    Count(usize),
}

#[derive(Debug)]
enum Engine {
    Threads { loops: Vec<LoopThread>, next: usize },
    Polled(Box<EventLoop>),
    External(Box<ExternalLoop>),
    Stopped,
}

/// A running HTTP server.
///
/// Dropping the daemon stops it like [`Daemon::destroy`].
#[derive(Debug)]
pub struct Daemon {
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    engine: Engine,
}

impl Daemon {
    /// Reports information about the daemon.
    pub fn info(&self, info: InfoType) -> Result<DaemonInfo> {
        match info {
            InfoType::BindPort => {
                let listener = self.listener.as_ref().ok_or(Error::InfoTypeUnknown)?;
                Ok(DaemonInfo::Port(listener.local_addr()?.port()))
            }
            InfoType::ListenFd => self
                .listener
                .as_ref()
                .map(|listener| DaemonInfo::Fd(listener.as_raw_fd()))
                .ok_or(Error::InfoTypeUnknown),
            InfoType::PollFd => match &self.engine {
                Engine::Polled(event_loop) => Ok(DaemonInfo::Fd(event_loop.poll_fd())),
                _ => Err(Error::InfoTypeUnknown),
            },
            InfoType::ConnectionCount => Ok(DaemonInfo::Count(self.shared.limits.active())),
        }
    }

    /// Serves a connection the application accepted itself.
    pub fn add_connection(&mut self, stream: std::net::TcpStream) -> Result<()> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(Error::TooLate);
        }
        match &mut self.engine {
            Engine::Threads { loops, next } if !loops.is_empty() => {
                let target = &loops[*next % loops.len()];
                *next = next.wrapping_add(1);
                target.send(Command::Add(stream)).map_err(Error::Io)
            }
            Engine::Polled(event_loop) => {
                event_loop.add_stream(stream);
                Ok(())
            }
            Engine::External(external) => {
                external.add_stream(stream);
                Ok(())
            }
            Engine::Threads { .. } | Engine::Stopped => Err(Error::TooLate),
        }
    }

    /// Waits at most `timeout` for network events and processes them. For
    /// [`WorkMode::ExternalPeriodic`] and [`WorkMode::ExternalSingleFdWatch`].
    pub fn run_wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        match &mut self.engine {
            Engine::Polled(event_loop) => {
                event_loop.run_once(timeout)?;
                Ok(())
            }
            _ => Err(Error::WrongWorkMode(
                "run_wait needs an externally polled work mode",
            )),
        }
    }

    /// Processes readiness the application observed on a watched socket. `ready` is the
    /// direction that became ready; [`WatchFor::None`] reports an error on the socket. For
    /// [`WorkMode::ExternalEvents`].
    pub fn process_external_event(&mut self, token: EventToken, ready: WatchFor) -> Result<()> {
        match &mut self.engine {
            Engine::External(external) => {
                external.process_event(token, ready);
                Ok(())
            }
            _ => Err(Error::WrongWorkMode(
                "external events need WorkMode::ExternalEvents",
            )),
        }
    }

    /// Resumes woken connections and closes timed out ones. For [`WorkMode::ExternalEvents`];
    /// call it after every batch of events and when [`Daemon::next_timeout`] expires.
    pub fn process_pending(&mut self) -> Result<()> {
        match &mut self.engine {
            Engine::External(external) => {
                external.process_pending();
                Ok(())
            }
            _ => Err(Error::WrongWorkMode(
                "pending work is only processed in WorkMode::ExternalEvents",
            )),
        }
    }

    /// Time until the next connection times out, in the external work modes.
    pub fn next_timeout(&self) -> Option<Duration> {
        match &self.engine {
            Engine::Polled(event_loop) => wait_time(event_loop.next_deadline(), None),
            Engine::External(external) => external.next_timeout(None),
            _ => None,
        }
    }

    /// Stops the daemon: refuses new connections, closes every open one and joins the daemon's
    /// threads.
    pub fn destroy(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        match mem::replace(&mut self.engine, Engine::Stopped) {
            Engine::Threads { loops, .. } => loops.into_iter().for_each(LoopThread::stop),
            Engine::Polled(mut event_loop) => event_loop.shutdown(),
            Engine::External(mut external) => external.shutdown(),
            Engine::Stopped => return,
        }
        log::info!("daemon stopped");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Configures and starts a [`Daemon`].
pub struct DaemonBuilder {
    config: DaemonConfig,
    handler: RequestHandler,
}

impl fmt::Debug for DaemonBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DaemonBuilder {
    /// A builder for a daemon answering requests with `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&mut Request<'_>) -> Option<Action> + Send + Sync + 'static,
    {
        DaemonBuilder {
            config: DaemonConfig::default(),
            handler: Box::new(handler),
        }
    }

    /// Applies one option.
    pub fn option(mut self, option: DaemonOption) -> Result<Self> {
        self.config.apply(option)?;
        Ok(self)
    }

    /// Applies several options in order.
    pub fn options<I>(self, options: I) -> Result<Self>
    where
        I: IntoIterator<Item = DaemonOption>,
    {
        options
            .into_iter()
            .try_fold(self, |builder, option| builder.option(option))
    }

    /// Opens the listening socket and starts serving.
    pub fn start(self) -> Result<Daemon> {
        let DaemonBuilder {
            mut config,
            handler,
        } = self;
        config.validate()?;

        match config.poll_syscall {
            PollSyscall::Select | PollSyscall::Poll => log::warn!(
                "{:?} is not available, using the system's readiness interface",
                config.poll_syscall
            ),
            PollSyscall::Auto | PollSyscall::Epoll => {}
        }

        let work_mode = mem::take(config.work_mode_mut());
        let listener = open_listener(&mut config)?;
        config.tls = tls_config(&mut config)?;
        log::info!(
            "starting daemon: {:?}, tls: {}",
            work_mode,
            config.tls.is_some()
        );

        let shared = Arc::new(Shared::new(config, handler));
        let clone = |listener: &Option<TcpListener>| -> Result<Option<TcpListener>> {
            Ok(listener.as_ref().map(TcpListener::try_clone).transpose()?)
        };
        let engine = match work_mode {
            WorkMode::WorkerThreads(n) => Engine::Threads {
                loops: worker::spawn_workers(&shared, listener.as_ref(), n)?,
                next: 0,
            },
            WorkMode::ThreadPerConnection => {
                let accept = clone(&listener)?.ok_or(Error::OptionConflict(
                    "a thread per connection needs a listening socket",
                ))?;
                Engine::Threads {
                    loops: vec![worker::spawn_acceptor(&shared, accept)?],
                    next: 0,
                }
            }
            WorkMode::ExternalPeriodic | WorkMode::ExternalSingleFdWatch => {
                Engine::Polled(Box::new(EventLoop::new(shared.clone(), clone(&listener)?)?))
            }
            WorkMode::ExternalEvents {
                register,
                edge_triggered,
            } => Engine::External(Box::new(ExternalLoop::new(
                shared.clone(),
                clone(&listener)?,
                register,
                edge_triggered,
            )?)),
        };

        let daemon = Daemon {
            shared,
            listener,
            engine,
        };
        if let Some(ready) = &daemon.shared.config.ready_callback {
            ready();
        }
        Ok(daemon)
    }
}

fn open_listener(config: &mut DaemonConfig) -> Result<Option<TcpListener>> {
    let candidates: Vec<(SocketAddr, Option<bool>)> = match mem::take(&mut config.bind) {
        Bind::None => return Ok(None),
        Bind::Socket(listener) => return Ok(Some(tcp_listener::adopt(listener)?)),
        Bind::Addr { addr, dual_stack } => vec![(addr, dual_stack)],
        Bind::Port { family, port } => {
            let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
            match family {
                AddressFamily::V4 => vec![(v4, None)],
                AddressFamily::V6 => vec![(v6, Some(false))],
                AddressFamily::Dual => vec![(v6, Some(true))],
                AddressFamily::Auto => vec![(v6, Some(true)), (v4, None)],
            }
        }
    };

    let fast_open = match config.fast_open {
        Some((FastOpenMode::Disable, _)) | None => None,
        Some((mode, queue)) => Some((queue, mode == FastOpenMode::Require)),
    };
    let mut failure = None;
    for (addr, dual_stack) in candidates {
        let options = ListenOptions {
            reuse_addr: config.reuse_addr,
            dual_stack,
            fast_open: None,
            backlog: config.backlog,
        };
        match bind_with_fast_open(addr, &options, fast_open) {
            Ok(listener) => {
                log::info!("listening on {}", listener.local_addr()?);
                return Ok(Some(listener));
            }
            Err(err) => {
                log::debug!("cannot listen on {}: {}", addr, err);
                failure = Some(err);
            }
        }
    }
    Err(Error::Io(failure.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to listen on")
    })))
}

fn bind_with_fast_open(
    addr: SocketAddr,
    options: &ListenOptions,
    fast_open: Option<(u32, bool)>,
) -> io::Result<TcpListener> {
    let Some((queue, required)) = fast_open else {
        return tcp_listener::bind(addr, options);
    };
    let with_fast_open = ListenOptions {
        fast_open: Some(queue),
        ..options.clone()
    };
    match tcp_listener::bind(addr, &with_fast_open) {
        Err(err) if !required => {
            log::warn!("TCP fast open is not available: {}", err);
            tcp_listener::bind(addr, options)
        }
        result => result,
    }
}

/// Builds the TLS configuration from a key and certificate pair, unless a complete one was
/// given.
fn tls_config(config: &mut DaemonConfig) -> Result<Option<Arc<ServerConfig>>> {
    if let Some(tls) = config.tls.take() {
        return Ok(Some(tls));
    }
    let Some((certs, key)) = config.tls_key_cert.take() else {
        return Ok(None);
    };

    let builder = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?;
    let builder = match config.tls_client_ca.take() {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|err| Error::Tls(rustls::Error::General(err.to_string())))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let mut tls = builder.with_single_cert(certs, key)?;
    if !config.no_alpn {
        tls.alpn_protocols = vec![b"http/1.1".to_vec(), b"http/1.0".to_vec()];
    }
    Ok(Some(Arc::new(tls)))
}

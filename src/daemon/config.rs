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

//! Daemon configuration

use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{RootCertStore, ServerConfig};

use crate::auth::nonce::{DEFAULT_MAP_SIZE, DEFAULT_MAX_NC, DEFAULT_NONCE_TIMEOUT};
use crate::auth::NonceBindType;
use crate::connection::CloseReason;
use crate::error::{Error, Result};
use crate::parser::{StrictHow, StrictLevel};

/// Default connection memory pool size.
pub const DEFAULT_CONN_MEMORY_LIMIT: usize = 32 * 1024;
/// Default budget for bodies buffered in full.
pub const DEFAULT_LARGE_POOL_SIZE: usize = 8 * 1024 * 1024;

/// Directions an external event loop must watch a socket for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchFor {
    /// Stop watching; the connection is suspended or about to be closed. Passed to
    /// [`Daemon::process_external_event`](crate::Daemon::process_external_event) it reports an
    /// error on the socket.
    None,
    /// Readable
    Recv,
    /// Writable
    Send,
    /// Readable or writable
    RecvSend,
}

impl WatchFor {
    /// True if readability is watched.
    pub fn recv(&self) -> bool {
        matches!(self, WatchFor::Recv | WatchFor::RecvSend)
    }

    /// True if writability is watched.
    pub fn send(&self) -> bool {
        matches!(self, WatchFor::Send | WatchFor::RecvSend)
    }
}

/// Identifies a socket to [`Daemon::process_external_event`](crate::Daemon::process_external_event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventToken(pub(crate) usize);

/// Value the application attaches to a watched socket.
pub type Cookie = usize;

/// Registers, updates or removes a socket in the application's event loop. Called with the
/// socket, the directions to watch, the cookie returned by the previous call for this socket,
/// and the token to report events with. Returns the new cookie, or `None` on failure; removal
/// returns `None` on success.
pub type RegisterCallback =
    Box<dyn FnMut(RawFd, WatchFor, Option<Cookie>, EventToken) -> Option<Cookie> + Send>;

/// How the daemon schedules its work.
pub enum WorkMode {
    /// No threads; the application calls [`Daemon::run_wait`](crate::Daemon::run_wait)
    /// periodically.
    ExternalPeriodic,
    /// No threads; the application watches sockets it is told about through `register` and
    /// reports their readiness.
    ExternalEvents {
        /// Registration callback
        register: RegisterCallback,
        /// The application's loop is edge triggered
        edge_triggered: bool,
    },
    /// No threads; the application watches a single descriptor from
    /// [`Daemon::info`](crate::Daemon::info) and calls
    /// [`Daemon::run_wait`](crate::Daemon::run_wait) when it is readable.
    ExternalSingleFdWatch,
    /// `n` threads, each with its own event loop, accepting from the shared socket.
    WorkerThreads(usize),
    /// A listening thread and one thread per connection.
    ThreadPerConnection,
}

impl Default for WorkMode {
    fn default() -> Self {
        WorkMode::WorkerThreads(1)
    }
}

impl fmt::Debug for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkMode::ExternalPeriodic => f.write_str("ExternalPeriodic"),
            WorkMode::ExternalEvents { edge_triggered, .. } => f
                .debug_struct("ExternalEvents")
                .field("edge_triggered", edge_triggered)
                .finish(),
            WorkMode::ExternalSingleFdWatch => f.write_str("ExternalSingleFdWatch"),
            WorkMode::WorkerThreads(n) => f.debug_tuple("WorkerThreads").field(n).finish(),
            WorkMode::ThreadPerConnection => f.write_str("ThreadPerConnection"),
        }
    }
}

/// Readiness interface of the internal event loops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollSyscall {
    /// Best available
    #[default]
    Auto,
    /// `select`
    Select,
    /// `poll`
    Poll,
    /// `epoll`
    Epoll,
}

/// Address family to listen on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv6 with IPv4 mapped addresses if possible, IPv4 otherwise
    #[default]
    Auto,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
    /// IPv6 and IPv4, failing if dual stack is not available
    Dual,
}

/// TCP Fast Open behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FastOpenMode {
    /// Leave the system default
    #[default]
    Disable,
    /// Enable, failing the start if the system refuses
    Require,
    /// Enable if the system allows
    Auto,
}

/// Event reported to [`DaemonOption::NotifyConnection`] and [`DaemonOption::NotifyStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionNotice {
    /// A connection was accepted.
    Started(Option<SocketAddr>),
    /// A connection was closed.
    Closed(Option<SocketAddr>, CloseReason),
}

/// Decides whether a client may connect.
pub type AcceptPolicy = Box<dyn Fn(&SocketAddr) -> bool + Send + Sync>;
/// Sees the request target before it is parsed further.
pub type EarlyUriLogger = Box<dyn Fn(&str) + Send + Sync>;
/// Called once the daemon is listening.
pub type ReadyCallback = Box<dyn Fn() + Send + Sync>;
/// Connection and stream life-cycle notifications.
pub type NotifyCallback = Box<dyn Fn(ConnectionNotice) + Send + Sync>;

/// Where the daemon listens.
#[derive(Debug, Default)]
pub(crate) enum Bind {
    /// No listening socket; connections are added by the application.
    #[default]
    None,
    Port {
        family: AddressFamily,
        port: u16,
    },
    Addr {
        addr: SocketAddr,
        dual_stack: Option<bool>,
    },
    Socket(TcpListener),
}

/// One daemon setting. Options are applied in order; later options win.
pub enum DaemonOption {
    /// Scheduling mode
    WorkMode(WorkMode),
    /// Readiness interface of internal loops
    PollSyscall(PollSyscall),
    /// Listen on all addresses of `family` at `port`. Port 0 picks a free port.
    BindPort {
        /// Address family
        family: AddressFamily,
        /// Port
        port: u16,
    },
    /// Listen on `addr`.
    BindSocketAddr {
        /// Address
        addr: SocketAddr,
        /// For IPv6 addresses: also accept IPv4 (`Some(true)`), IPv6 only (`Some(false)`) or the
        /// system default (`None`)
        dual_stack: Option<bool>,
    },
    /// Use an already bound and listening socket.
    ListenSocket(TcpListener),
    /// Allow binding to an address in use by other sockets with the same option.
    ListenAddrReuse,
    /// TCP Fast Open
    TcpFastOpen {
        /// Mode
        mode: FastOpenMode,
        /// Pending Fast Open request queue length
        queue_length: u32,
    },
    /// Listen backlog
    ListenBacklog(i32),
    /// Serve TLS with this configuration.
    Tls(Arc<ServerConfig>),
    /// Serve TLS with this certificate chain and key.
    TlsKeyCert {
        /// Certificate chain, leaf first
        certs: Vec<CertificateDer<'static>>,
        /// Private key
        key: PrivateKeyDer<'static>,
    },
    /// Require client certificates issued by these roots.
    TlsClientCa(RootCertStore),
    /// Do not offer ALPN.
    NoAlpn,
    /// Idle timeout of connections
    DefaultTimeout(Duration),
    /// Maximum number of connections
    GlobalConnectionLimit(usize),
    /// Maximum number of connections per client address
    PerIpLimit(usize),
    /// Filter for new connections
    AcceptPolicy(AcceptPolicy),
    /// Parser tolerance
    ProtocolStrictLevel {
        /// Level from -3 (lenient) to 3 (strict)
        level: i8,
        /// Treatment of out-of-range levels
        how: StrictHow,
    },
    /// See request targets before they are parsed.
    EarlyUriLogger(EarlyUriLogger),
    /// Keep `+` in query arguments instead of decoding it as space.
    DisableUriQueryPlusAsSpace,
    /// Do not send a `Date` header.
    SuppressDateHeader,
    /// Allow responses with the `ICY` status line.
    EnableShoutcast,
    /// Memory pool size per connection
    ConnMemoryLimit(usize),
    /// Memory for bodies buffered in full, shared by all connections
    LargePoolSize(usize),
    /// Stack size of daemon threads
    StackSize(usize),
    /// Highest descriptor number accepted
    FdNumberLimit(usize),
    /// Skip checks on sockets the daemon created itself.
    Turbo,
    /// The daemon is only used from one thread.
    DisableThreadSafety,
    /// Refuse upgrade actions.
    DisallowUpgrade,
    /// Refuse suspend actions.
    DisallowSuspendResume,
    /// Called once the daemon is ready.
    DaemonReadyCallback(ReadyCallback),
    /// Connection life-cycle notifications
    NotifyConnection(NotifyCallback),
    /// Stream life-cycle notifications
    NotifyStream(NotifyCallback),
    /// Extra entropy mixed into Digest nonces
    RandomEntropy(Vec<u8>),
    /// Number of remembered Digest nonces
    DauthMapSize(usize),
    /// Request properties Digest nonces are bound to
    DauthNonceBindType(NonceBindType),
    /// Validity of Digest nonces
    DauthDefNonceTimeout(Duration),
    /// Highest Digest nonce-count accepted
    DauthDefMaxNc(u32),
}

impl fmt::Debug for DaemonOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonOption::WorkMode(mode) => f.debug_tuple("WorkMode").field(mode).finish(),
            DaemonOption::BindPort { family, port } => f
                .debug_struct("BindPort")
                .field("family", family)
                .field("port", port)
                .finish(),
            DaemonOption::BindSocketAddr { addr, .. } => {
                f.debug_tuple("BindSocketAddr").field(addr).finish()
            }
            DaemonOption::ProtocolStrictLevel { level, .. } => {
                f.debug_tuple("ProtocolStrictLevel").field(level).finish()
            }
            DaemonOption::Tls(_) => f.write_str("Tls"),
            DaemonOption::TlsKeyCert { .. } => f.write_str("TlsKeyCert"),
            _ => f.write_str("DaemonOption"),
        }
    }
}

/// Settings of a daemon.
pub(crate) struct DaemonConfig {
    // Only reached through `&mut`. The mutex keeps the config `Sync` while the registration
    // callback of `WorkMode::ExternalEvents` is not.
    work_mode: Mutex<WorkMode>,
    pub(crate) poll_syscall: PollSyscall,
    pub(crate) bind: Bind,
    pub(crate) reuse_addr: bool,
    pub(crate) fast_open: Option<(FastOpenMode, u32)>,
    pub(crate) backlog: Option<i32>,
    pub(crate) tls: Option<Arc<ServerConfig>>,
    pub(crate) tls_key_cert: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    pub(crate) tls_client_ca: Option<RootCertStore>,
    pub(crate) no_alpn: bool,
    pub(crate) default_timeout: Option<Duration>,
    pub(crate) global_connection_limit: Option<usize>,
    pub(crate) per_ip_limit: Option<usize>,
    pub(crate) accept_policy: Option<AcceptPolicy>,
    pub(crate) strict: StrictLevel,
    pub(crate) early_uri_logger: Option<EarlyUriLogger>,
    pub(crate) plus_as_space: bool,
    pub(crate) suppress_date: bool,
    pub(crate) enable_shoutcast: bool,
    pub(crate) conn_memory_limit: usize,
    pub(crate) large_pool_size: usize,
    pub(crate) stack_size: Option<usize>,
    pub(crate) fd_number_limit: Option<usize>,
    pub(crate) turbo: bool,
    pub(crate) disable_thread_safety: bool,
    pub(crate) disallow_upgrade: bool,
    pub(crate) disallow_suspend_resume: bool,
    pub(crate) ready_callback: Option<ReadyCallback>,
    pub(crate) notify_connection: Option<NotifyCallback>,
    pub(crate) notify_stream: Option<NotifyCallback>,
    pub(crate) random_entropy: Vec<u8>,
    pub(crate) dauth_map_size: usize,
    pub(crate) dauth_bind: NonceBindType,
    pub(crate) dauth_nonce_timeout: Duration,
    pub(crate) dauth_max_nc: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            work_mode: Mutex::new(WorkMode::default()),
            poll_syscall: PollSyscall::Auto,
            bind: Bind::None,
            reuse_addr: false,
            fast_open: None,
            backlog: None,
            tls: None,
            tls_key_cert: None,
            tls_client_ca: None,
            no_alpn: false,
            default_timeout: None,
            global_connection_limit: None,
            per_ip_limit: None,
            accept_policy: None,
            strict: StrictLevel::DEFAULT,
            early_uri_logger: None,
            plus_as_space: true,
            suppress_date: false,
            enable_shoutcast: false,
            conn_memory_limit: DEFAULT_CONN_MEMORY_LIMIT,
            large_pool_size: DEFAULT_LARGE_POOL_SIZE,
            stack_size: None,
            fd_number_limit: None,
            turbo: false,
            disable_thread_safety: false,
            disallow_upgrade: false,
            disallow_suspend_resume: false,
            ready_callback: None,
            notify_connection: None,
            notify_stream: None,
            random_entropy: Vec::new(),
            dauth_map_size: DEFAULT_MAP_SIZE,
            dauth_bind: NonceBindType::default(),
            dauth_nonce_timeout: DEFAULT_NONCE_TIMEOUT,
            dauth_max_nc: DEFAULT_MAX_NC,
        }
    }
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("work_mode", &self.work_mode)
            .field("bind", &self.bind)
            .field("tls", &self.tls.is_some())
            .field("strict", &self.strict)
            .field("default_timeout", &self.default_timeout)
            .field("conn_memory_limit", &self.conn_memory_limit)
            .finish_non_exhaustive()
    }
}

/// Smallest pool that can hold a request line, a few headers and a reply head.
const MIN_CONN_MEMORY: usize = 1024;

impl DaemonConfig {
    pub(crate) fn work_mode_mut(&mut self) -> &mut WorkMode {
        self.work_mode
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds one option into the configuration.
    pub(crate) fn apply(&mut self, option: DaemonOption) -> Result<()> {
        match option {
            DaemonOption::WorkMode(mode) => {
                if let WorkMode::WorkerThreads(0) = mode {
                    return Err(Error::OptionConflict("at least one worker thread is needed"));
                }
                *self.work_mode_mut() = mode;
            }
            DaemonOption::PollSyscall(syscall) => self.poll_syscall = syscall,
            DaemonOption::BindPort { family, port } => self.bind = Bind::Port { family, port },
            DaemonOption::BindSocketAddr { addr, dual_stack } => {
                self.bind = Bind::Addr { addr, dual_stack }
            }
            DaemonOption::ListenSocket(listener) => self.bind = Bind::Socket(listener),
            DaemonOption::ListenAddrReuse => self.reuse_addr = true,
            DaemonOption::TcpFastOpen { mode, queue_length } => {
                self.fast_open = Some((mode, queue_length))
            }
            DaemonOption::ListenBacklog(backlog) => {
                if backlog <= 0 {
                    return Err(Error::OptionConflict("listen backlog must be positive"));
                }
                self.backlog = Some(backlog);
            }
            DaemonOption::Tls(config) => self.tls = Some(config),
            DaemonOption::TlsKeyCert { certs, key } => self.tls_key_cert = Some((certs, key)),
            DaemonOption::TlsClientCa(roots) => self.tls_client_ca = Some(roots),
            DaemonOption::NoAlpn => self.no_alpn = true,
            DaemonOption::DefaultTimeout(timeout) => {
                self.default_timeout = (!timeout.is_zero()).then_some(timeout)
            }
            DaemonOption::GlobalConnectionLimit(limit) => {
                self.global_connection_limit = Some(limit)
            }
            DaemonOption::PerIpLimit(limit) => self.per_ip_limit = Some(limit),
            DaemonOption::AcceptPolicy(policy) => self.accept_policy = Some(policy),
            DaemonOption::ProtocolStrictLevel { level, how } => {
                self.strict = StrictLevel::new(level, how)
                    .ok_or(Error::OptionConflict("strict level out of range"))?;
            }
            DaemonOption::EarlyUriLogger(logger) => self.early_uri_logger = Some(logger),
            DaemonOption::DisableUriQueryPlusAsSpace => self.plus_as_space = false,
            DaemonOption::SuppressDateHeader => self.suppress_date = true,
            DaemonOption::EnableShoutcast => self.enable_shoutcast = true,
            DaemonOption::ConnMemoryLimit(limit) => {
                if limit < MIN_CONN_MEMORY {
                    return Err(Error::OptionConflict("connection memory limit is too small"));
                }
                self.conn_memory_limit = limit;
            }
            DaemonOption::LargePoolSize(size) => self.large_pool_size = size,
            DaemonOption::StackSize(size) => self.stack_size = Some(size),
            DaemonOption::FdNumberLimit(limit) => self.fd_number_limit = Some(limit),
            DaemonOption::Turbo => self.turbo = true,
            DaemonOption::DisableThreadSafety => self.disable_thread_safety = true,
            DaemonOption::DisallowUpgrade => self.disallow_upgrade = true,
            DaemonOption::DisallowSuspendResume => self.disallow_suspend_resume = true,
            DaemonOption::DaemonReadyCallback(cb) => self.ready_callback = Some(cb),
            DaemonOption::NotifyConnection(cb) => self.notify_connection = Some(cb),
            DaemonOption::NotifyStream(cb) => self.notify_stream = Some(cb),
            DaemonOption::RandomEntropy(bytes) => self.random_entropy = bytes,
            DaemonOption::DauthMapSize(size) => {
                if size == 0 {
                    return Err(Error::OptionConflict("digest nonce map needs at least one slot"));
                }
                self.dauth_map_size = size;
            }
            DaemonOption::DauthNonceBindType(bind) => self.dauth_bind = bind,
            DaemonOption::DauthDefNonceTimeout(timeout) => self.dauth_nonce_timeout = timeout,
            DaemonOption::DauthDefMaxNc(max) => self.dauth_max_nc = max,
        }
        Ok(())
    }

    /// Checks combinations that single options cannot detect.
    pub(crate) fn validate(&mut self) -> Result<()> {
        let per_connection = matches!(self.work_mode_mut(), WorkMode::ThreadPerConnection);
        if self.disable_thread_safety {
            match *self.work_mode_mut() {
                WorkMode::WorkerThreads(n) if n > 1 => {
                    return Err(Error::OptionConflict(
                        "thread safety cannot be disabled with several worker threads",
                    ))
                }
                WorkMode::ThreadPerConnection => {
                    return Err(Error::OptionConflict(
                        "thread safety cannot be disabled with a thread per connection",
                    ))
                }
                _ => {}
            }
        }
        if self.tls.is_some() && self.tls_key_cert.is_some() {
            return Err(Error::OptionConflict(
                "a TLS configuration and a key/certificate pair are exclusive",
            ));
        }
        if self.tls_client_ca.is_some() && self.tls_key_cert.is_none() {
            return Err(Error::OptionConflict(
                "client certificate roots need a key/certificate pair",
            ));
        }
        if per_connection && matches!(self.bind, Bind::None) {
            return Err(Error::OptionConflict(
                "a thread per connection needs a listening socket",
            ));
        }
        Ok(())
    }
}

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

//! Library status codes returned from the application-facing API.

use std::io;

/// Result alias used throughout the public API.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the library to the application.
///
/// A successful call is `Ok(..)`; every other library status has a variant here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The object has already been frozen or started and cannot be changed anymore.
    #[error("too late to change this object")]
    TooLate,
    /// The connection pool had no room for decoded authorization data.
    #[error("connection pool has no memory for authorization data")]
    ConnectionPoolNoMemAuthData,
    /// The client sent authorization data that could not be decoded.
    #[error("request authorization data is broken")]
    ReqAuthDataBroken,
    /// The request carries no authorization data of the requested scheme.
    #[error("authorization data is absent")]
    AuthAbsent,
    /// No response object was supplied.
    #[error("response is missing")]
    RespPointerNull,
    /// The HTTP status code is not suitable for this operation.
    #[error("HTTP status code is not suitable")]
    RespHttpCodeNotSuitable,
    /// A header name or value contains forbidden characters.
    #[error("response header value is invalid")]
    RespHeaderValueInvalid,
    /// Memory for the response header could not be obtained.
    #[error("failed to allocate memory for the response header")]
    ResponseHeaderMemAllocFailed,
    /// The header conflicts with the response configuration.
    #[error("response header conflicts with response settings")]
    RespHeadersConflict,
    /// The response settings lock was poisoned.
    #[error("failed to lock the response settings")]
    ResponseMutexLockFailed,
    /// The requested information type is not known in this mode.
    #[error("information type is unknown")]
    InfoTypeUnknown,
    /// The provided buffer is too small for the requested information.
    #[error("buffer is too small for the requested information")]
    InfoGetBuffTooSmall,
    /// The Digest algorithm is not supported.
    #[error("Digest algorithm is not supported")]
    AuthDigestAlgoNotSupported,
    /// The Digest QOP is not supported.
    #[error("Digest QOP is not supported")]
    AuthDigestQopNotSupported,
    /// The application failed to de-register a socket in external events mode.
    #[error("external event de-registration failed")]
    ExtrEventDeregFailed,
    /// Two daemon options cannot be combined, or an option value is out of range.
    #[error("daemon option conflict: {0}")]
    OptionConflict(&'static str),
    /// Socket set-up failed while starting the daemon.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The TLS configuration was rejected.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    /// The operation does not exist in the daemon's work mode.
    #[error("not available in this work mode: {0}")]
    WrongWorkMode(&'static str),
    /// A daemon thread could not be started.
    #[error("failed to launch daemon thread: {0}")]
    ThreadLaunch(io::Error),
}

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

//! Digest nonces
//!
//! A nonce is 48 hex digits of random data followed by 16 hex digits of the creation time in
//! milliseconds. Every nonce handed out is remembered in a fixed-size open-addressed map together
//! with the nonce-counts already used with it; a nonce whose slot was taken over by a newer one
//! is reported as stale so the client retries with a fresh challenge.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

/// Length of a nonce in characters.
pub(crate) const NONCE_LEN: usize = 64;
const RANDOM_LEN: usize = 48;

/// Default number of remembered nonces.
pub const DEFAULT_MAP_SIZE: usize = 1000;
/// Default validity of a nonce.
pub const DEFAULT_NONCE_TIMEOUT: Duration = Duration::from_secs(90);
/// Default highest nonce-count accepted.
pub const DEFAULT_MAX_NC: u32 = 1000;

/// Request properties a nonce is bound to. A nonce only validates for requests that match the
/// request it was issued to in every bound property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonceBindType {
    /// Same request method
    pub method: bool,
    /// Same request target
    pub uri: bool,
    /// Same client address
    pub client_ip: bool,
}

/// Outcome of a nonce check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NonceCheck {
    Valid,
    /// Expired, evicted, or a nonce-count outside the accepted window.
    Stale,
    /// Never issued by this daemon, or issued for a different request.
    Wrong,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    nonce: [u8; NONCE_LEN],
    bind_key: u64,
    last_nc: u64,
    /// Bit `i` set: `last_nc - 1 - i` was used.
    used_below: u64,
}

/// Daemon-wide nonce generator and replay map.
#[derive(Debug)]
pub(crate) struct NonceStore {
    slots: Mutex<Vec<Option<Entry>>>,
    rng: SystemRandom,
    entropy: Vec<u8>,
    counter: AtomicU64,
    timeout: Duration,
    max_nc: u32,
    bind: NonceBindType,
}

impl NonceStore {
    pub(crate) fn new(
        map_size: usize,
        timeout: Duration,
        max_nc: u32,
        bind: NonceBindType,
        entropy: Vec<u8>,
    ) -> Self {
        NonceStore {
            slots: Mutex::new(vec![None; map_size.max(1)]),
            rng: SystemRandom::new(),
            entropy,
            counter: AtomicU64::new(0),
            timeout,
            max_nc,
            bind,
        }
    }

    /// Key that ties a nonce to the bound properties of a request.
    pub(crate) fn bind_key(&self, method: &[u8], target: &[u8], client: Option<IpAddr>) -> u64 {
        let mut hasher = DefaultHasher::new();
        if self.bind.method {
            method.hash(&mut hasher);
        }
        if self.bind.uri {
            target.hash(&mut hasher);
        }
        if self.bind.client_ip {
            client.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Creates and remembers a new nonce. `None` if the system random source failed.
    pub(crate) fn generate(&self, bind_key: u64) -> Option<[u8; NONCE_LEN]> {
        let mut seed = [0u8; 32];
        self.rng.fill(&mut seed).ok()?;

        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&seed);
        ctx.update(&self.entropy);
        ctx.update(&self.counter.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        let random = ctx.finish();

        let mut nonce = [0u8; NONCE_LEN];
        write_hex(&random.as_ref()[..RANDOM_LEN / 2], &mut nonce[..RANDOM_LEN]);
        write_hex(&now_millis().to_be_bytes(), &mut nonce[RANDOM_LEN..]);

        let entry = Entry {
            nonce,
            bind_key,
            last_nc: 0,
            used_below: 0,
        };
        match self.slots.lock() {
            Ok(mut slots) => {
                let idx = slot_index(&nonce, slots.len());
                slots[idx] = Some(entry);
            }
            Err(_) => {
                log::error!("digest nonce map lock poisoned");
                return None;
            }
        }
        Some(nonce)
    }

    /// Checks a nonce and nonce-count sent by a client and records the nonce-count as used.
    pub(crate) fn check(&self, nonce: &[u8], nc: u64, bind_key: u64) -> NonceCheck {
        if nonce.len() != NONCE_LEN || !nonce.iter().all(u8::is_ascii_hexdigit) {
            return NonceCheck::Wrong;
        }
        let Some(issued) = parse_hex_u64(&nonce[RANDOM_LEN..]) else {
            return NonceCheck::Wrong;
        };
        let now = now_millis();
        if issued > now {
            return NonceCheck::Wrong;
        }
        if now - issued > self.timeout.as_millis() as u64 {
            return NonceCheck::Stale;
        }
        if nc == 0 {
            return NonceCheck::Wrong;
        }
        if nc > u64::from(self.max_nc) {
            return NonceCheck::Stale;
        }

        let Ok(mut slots) = self.slots.lock() else {
            log::error!("digest nonce map lock poisoned");
            return NonceCheck::Stale;
        };
        let idx = slot_index(nonce, slots.len());
        let Some(entry) = slots[idx].as_mut().filter(|e| e.nonce[..] == *nonce) else {
            return NonceCheck::Stale;
        };
        if entry.bind_key != bind_key {
            return NonceCheck::Wrong;
        }

        if nc > entry.last_nc {
            let shift = nc - entry.last_nc;
            entry.used_below = if shift > 64 {
                0
            } else {
                // the previous last_nc becomes bit shift - 1
                let shifted = entry.used_below.checked_shl(shift as u32).unwrap_or(0);
                if entry.last_nc == 0 {
                    shifted
                } else {
                    shifted | (1u64 << (shift - 1))
                }
            };
            entry.last_nc = nc;
            return NonceCheck::Valid;
        }

        let distance = entry.last_nc - nc;
        if distance == 0 || distance > 64 {
            return NonceCheck::Stale;
        }
        let bit = 1u64 << (distance - 1);
        if entry.used_below & bit != 0 {
            return NonceCheck::Stale;
        }
        entry.used_below |= bit;
        NonceCheck::Valid
    }
}

fn slot_index(nonce: &[u8], len: usize) -> usize {
    let key = parse_hex_u64(&nonce[..16]).unwrap_or(0);
    (key % len as u64) as usize
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn write_hex(bytes: &[u8], out: &mut [u8]) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    for (i, b) in bytes.iter().enumerate() {
        out[i * 2] = DIGITS[(b >> 4) as usize];
        out[i * 2 + 1] = DIGITS[(b & 0xf) as usize];
    }
}

fn parse_hex_u64(hex: &[u8]) -> Option<u64> {
    if hex.is_empty() || hex.len() > 16 {
        return None;
    }
    let s = std::str::from_utf8(hex).ok()?;
    u64::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> NonceStore {
        NonceStore::new(
            16,
            DEFAULT_NONCE_TIMEOUT,
            DEFAULT_MAX_NC,
            NonceBindType::default(),
            b"test".to_vec(),
        )
    }

    #[test]
    fn generated_nonces_are_hex_and_unique() {
        let store = store();
        let a = store.generate(0).unwrap();
        let b = store.generate(0).unwrap();
        assert!(a.iter().all(u8::is_ascii_hexdigit));
        assert_ne!(a, b);
    }

    #[test]
    fn nonce_counts_are_not_replayable() {
        let store = store();
        let nonce = store.generate(0).unwrap();
        assert_eq!(NonceCheck::Valid, store.check(&nonce, 1, 0));
        assert_eq!(NonceCheck::Stale, store.check(&nonce, 1, 0));
        assert_eq!(NonceCheck::Valid, store.check(&nonce, 3, 0));
        assert_eq!(NonceCheck::Valid, store.check(&nonce, 2, 0));
        assert_eq!(NonceCheck::Stale, store.check(&nonce, 2, 0));
        assert_eq!(NonceCheck::Stale, store.check(&nonce, 1, 0));
        assert_eq!(NonceCheck::Stale, store.check(&nonce, 1001, 0));
        assert_eq!(NonceCheck::Wrong, store.check(&nonce, 0, 0));
    }

    #[test]
    fn unknown_and_rebound_nonces() {
        let store = store();
        let nonce = store.generate(7).unwrap();
        assert_eq!(NonceCheck::Wrong, store.check(&nonce, 1, 8));
        assert_eq!(NonceCheck::Wrong, store.check(b"xyz", 1, 7));

        let mut forged = nonce;
        forged[0] = if forged[0] == b'a' { b'b' } else { b'a' };
        assert_ne!(NonceCheck::Valid, store.check(&forged, 1, 7));
    }

    #[test]
    fn expired_nonce_is_stale() {
        let store = NonceStore::new(
            4,
            Duration::ZERO,
            DEFAULT_MAX_NC,
            NonceBindType::default(),
            Vec::new(),
        );
        let nonce = store.generate(0).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(NonceCheck::Stale, store.check(&nonce, 1, 0));
    }

    #[test]
    fn bind_key_covers_selected_properties() {
        let store = NonceStore::new(
            4,
            DEFAULT_NONCE_TIMEOUT,
            DEFAULT_MAX_NC,
            NonceBindType {
                uri: true,
                ..NonceBindType::default()
            },
            Vec::new(),
        );
        assert_eq!(
            store.bind_key(b"GET", b"/a", None),
            store.bind_key(b"POST", b"/a", None)
        );
        assert_ne!(
            store.bind_key(b"GET", b"/a", None),
            store.bind_key(b"GET", b"/b", None)
        );
    }
}

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

//! Connection limits enforced at accept

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    by_ip: HashMap<IpAddr, usize>,
}

/// Global and per client address connection caps.
#[derive(Debug, Default)]
pub(crate) struct Limits {
    global: Option<usize>,
    per_ip: Option<usize>,
    counts: Mutex<Counts>,
}

impl Limits {
    pub(crate) fn new(global: Option<usize>, per_ip: Option<usize>) -> Self {
        Limits {
            global,
            per_ip,
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Counts a new connection from `ip`, or returns `None` if a cap is reached. The
    /// connection is counted until the returned guard is dropped.
    pub(crate) fn admit(self: &Arc<Self>, ip: Option<IpAddr>) -> Option<Admission> {
        let ip = ip.map(|ip| ip.to_canonical());
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);

        if self.global.map_or(false, |max| counts.total >= max) {
            log::debug!("global connection limit of {} reached", counts.total);
            return None;
        }
        if let (Some(max), Some(ip)) = (self.per_ip, ip) {
            let current = counts.by_ip.get(&ip).copied().unwrap_or(0);
            if current >= max {
                log::debug!("connection limit for {} reached", ip);
                return None;
            }
            counts.by_ip.insert(ip, current + 1);
        }
        counts.total += 1;

        Some(Admission {
            limits: self.clone(),
            ip,
        })
    }

    /// Number of admitted connections.
    pub(crate) fn active(&self) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total
    }

    fn release(&self, ip: Option<IpAddr>) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.total = counts.total.saturating_sub(1);
        if let (Some(_), Some(ip)) = (self.per_ip, ip) {
            if let Some(n) = counts.by_ip.get_mut(&ip) {
                *n -= 1;
                if *n == 0 {
                    counts.by_ip.remove(&ip);
                }
            }
        }
    }
}

/// Keeps one connection counted against the limits.
#[derive(Debug)]
pub(crate) struct Admission {
    limits: Arc<Limits>,
    ip: Option<IpAddr>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.limits.release(self.ip);
    }
}

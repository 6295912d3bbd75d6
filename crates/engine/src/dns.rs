/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::Ipv4Addr;

/// The reputation-lookup capability. Implementations own their timeout (the
/// configured `rbl_timeout`); a lookup that times out or finds nothing
/// returns `None`, which the rule engine reads as "not listed".
pub trait DnsResolver: Send + Sync {
    fn lookup_a(&self, name: &str) -> Option<Vec<Ipv4Addr>>;
}

/// The resolver used when DNS is unavailable or skipped: every query misses.
pub struct NullResolver;

impl DnsResolver for NullResolver {
    fn lookup_a(&self, _name: &str) -> Option<Vec<Ipv4Addr>> {
        None
    }
}

/// System resolver with a hard timeout: the lookup runs on a throwaway
/// thread and an answer that misses the deadline counts as a miss.
pub struct SystemResolver {
    pub timeout: std::time::Duration,
}

impl DnsResolver for SystemResolver {
    fn lookup_a(&self, name: &str) -> Option<Vec<Ipv4Addr>> {
        use std::net::ToSocketAddrs;

        let (tx, rx) = std::sync::mpsc::channel();
        let name = format!("{name}:0");
        std::thread::spawn(move || {
            let result = name.to_socket_addrs().map(|addrs| {
                addrs
                    .filter_map(|addr| match addr.ip() {
                        std::net::IpAddr::V4(ip) => Some(ip),
                        std::net::IpAddr::V6(_) => None,
                    })
                    .collect::<Vec<_>>()
            });
            let _ = tx.send(result);
        });
        match rx.recv_timeout(self.timeout) {
            Ok(Ok(ips)) if !ips.is_empty() => Some(ips),
            _ => None,
        }
    }
}

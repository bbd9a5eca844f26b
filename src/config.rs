// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Configuration for the resolver: the nameserver list and the tuning
//! options, loadable from the system's `/etc/resolv.conf`.

use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{ResolveErrorKind, ResolveResult};

/// The standard DNS port
pub const DEFAULT_PORT: u16 = 53;

/// Configuration of the upstream nameservers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    nameservers: Vec<IpAddr>,
}

impl ResolverConfig {
    /// Create a configuration from an explicit list of nameservers.
    ///
    /// The order is significant: the first attempt of every lookup targets
    /// the first entry unless rotation is enabled.
    pub fn from_nameservers(nameservers: Vec<IpAddr>) -> Self {
        Self { nameservers }
    }

    /// The configured nameservers
    pub fn nameservers(&self) -> &[IpAddr] {
        &self.nameservers
    }

    /// Append a nameserver to the list
    pub fn add_nameserver(&mut self, nameserver: IpAddr) {
        self.nameservers.push(nameserver);
    }
}

/// Configuration for the resolver's behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResolverOpts {
    /// Time to wait for a response after the last send before a lookup is
    /// considered timed out. Defaults to 5 seconds.
    pub timeout: Duration,
    /// Spacing between retransmissions. Equal to `timeout` in this design;
    /// kept separate so callers can read back what they configured.
    pub interval: Duration,
    /// Number of datagrams sent per lookup before giving up. Defaults to 2.
    pub attempts: usize,
    /// Maximum number of lookups in flight at once; the rest wait their
    /// turn. Zero admits nothing: queued lookups stay parked until the
    /// capacity is raised. Defaults to 1024.
    pub capacity: usize,
    /// Distribute attempts over the nameservers with a per-lookup offset
    /// instead of always starting at the first. Defaults to false.
    pub rotate: bool,
    /// Send and receive buffer size for each UDP socket, in bytes. Larger
    /// buffers lower the risk of dropped datagrams under load.
    pub buffer_size: usize,
    /// Destination port on the nameservers. Defaults to 53; overridable so
    /// test setups can point at unprivileged mock servers.
    pub port: u16,
}

impl Default for ResolverOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(5),
            attempts: 2,
            capacity: 1024,
            rotate: false,
            buffer_size: 256 * 1024,
            port: DEFAULT_PORT,
        }
    }
}

/// Read the system configuration from `/etc/resolv.conf`.
pub fn system_conf() -> ResolveResult<(ResolverConfig, ResolverOpts)> {
    read_resolv_conf("/etc/resolv.conf")
}

fn read_resolv_conf<P: AsRef<Path>>(path: P) -> ResolveResult<(ResolverConfig, ResolverOpts)> {
    let mut data = String::new();
    let mut file = File::open(path)?;
    file.read_to_string(&mut data)?;
    parse_resolv_conf(&data)
}

/// Parse resolver configuration in `resolv.conf` syntax.
pub fn parse_resolv_conf<T: AsRef<[u8]>>(data: T) -> ResolveResult<(ResolverConfig, ResolverOpts)> {
    let parsed = resolv_conf::Config::parse(&data)
        .map_err(|e| ResolveErrorKind::Config(format!("error parsing resolv.conf: {e:?}")))?;
    Ok(into_resolver_config(parsed))
}

fn into_resolver_config(parsed: resolv_conf::Config) -> (ResolverConfig, ResolverOpts) {
    let nameservers: Vec<IpAddr> = parsed.nameservers.iter().map(IpAddr::from).collect();
    if nameservers.is_empty() {
        tracing::warn!("no nameservers found in config");
    }

    let timeout = Duration::from_secs(u64::from(parsed.timeout));
    let options = ResolverOpts {
        timeout,
        interval: timeout,
        attempts: parsed.attempts as usize,
        rotate: parsed.rotate,
        ..ResolverOpts::default()
    };

    (ResolverConfig::from_nameservers(nameservers), options)
}

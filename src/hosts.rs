// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hosts result from a configuration of the system hosts file

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::path::Path;

use tracing::warn;

use crate::op::{Query, RecordType, Response};

/// TTL put on answers synthesized from the hosts file
const HOSTS_TTL: u32 = 86_400;

/// The local hosts database, a parsed `/etc/hosts`.
///
/// Names that appear here are answered locally: a matching lookup never
/// reaches a nameserver, and an NXDOMAIN received from a nameserver for a
/// listed name is rewritten to a clean empty answer.
#[derive(Debug, Default)]
pub struct Hosts {
    /// name -> addresses, names lowercased
    by_name: HashMap<String, Vec<IpAddr>>,
}

impl Hosts {
    /// Load the system hosts file.
    pub fn new() -> io::Result<Self> {
        Self::from_path("/etc/hosts")
    }

    /// Load a hosts file from an explicit path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::default().read_hosts_conf(file)
    }

    /// Parse hosts configuration from `src`.
    ///
    /// Lines have the form `addr host1 host2 ...`; `#` starts a comment;
    /// empty lines and lines without at least one hostname are ignored.
    pub fn read_hosts_conf(mut self, src: impl io::Read) -> io::Result<Self> {
        use std::io::{BufRead, BufReader};

        for line in BufReader::new(src).lines() {
            let line = line?;
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<_> = line.split_whitespace().collect();
            if fields.len() < 2 {
                continue;
            }
            let addr: IpAddr = match fields[0].parse() {
                Ok(addr) => addr,
                Err(_) => {
                    warn!("could not parse an IP from hosts file: {}", fields[0]);
                    continue;
                }
            };

            for name in fields.iter().skip(1).map(|name| name.to_lowercase()) {
                self.by_name.entry(name).or_default().push(addr);
            }
        }

        Ok(self)
    }

    /// Whether the database holds any entry for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(&name.to_lowercase())
    }

    /// The addresses for `name` that answer a query of `query_type`.
    pub fn lookup(&self, name: &str, query_type: RecordType) -> Vec<IpAddr> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|addrs| {
                addrs
                    .iter()
                    .copied()
                    .filter(|addr| match addr {
                        IpAddr::V4(_) => query_type == RecordType::A,
                        IpAddr::V6(_) => query_type == RecordType::AAAA,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Compose the answer for a query whose name is listed here.
    ///
    /// The answer section carries the matching addresses; a listed name with
    /// no address of the requested family yields a clean empty answer.
    pub fn compose(&self, query: &Query) -> Response {
        let question = query.question();
        let addresses = self.lookup(question.name(), question.query_type());
        Response::answer(query, &addresses, HOSTS_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const HOSTS: &str = "\
127.0.0.1 localhost
::1 localhost # the usual alias
10.0.1.102 example.com
10.0.1.111 a.example.com b.example.com

# comment only
255.255.255.255 broadcasthost
not-an-address oops
";

    fn hosts() -> Hosts {
        Hosts::default().read_hosts_conf(HOSTS.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_and_lookup() {
        let hosts = hosts();

        assert!(hosts.contains("localhost"));
        assert!(hosts.contains("LOCALHOST"));
        assert!(hosts.contains("b.example.com"));
        assert!(!hosts.contains("oops"));
        assert!(!hosts.contains("missing.example.com"));

        assert_eq!(
            hosts.lookup("localhost", RecordType::A),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        );
        assert_eq!(
            hosts.lookup("localhost", RecordType::AAAA),
            vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]
        );
        assert_eq!(
            hosts.lookup("a.example.com", RecordType::A),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 111))]
        );
    }

    #[test]
    fn test_compose_positive_answer() {
        let query = Query::with_id("example.com", RecordType::A, 5).unwrap();
        let response = hosts().compose(&query);

        assert!(query.matches(&response));
        assert_eq!(response.response_code(), crate::op::ResponseCode::NoError);
        assert_eq!(
            response.addresses().unwrap(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 102))]
        );
    }

    #[test]
    fn test_compose_empty_answer_for_missing_family() {
        // example.com has no AAAA entry
        let query = Query::with_id("example.com", RecordType::AAAA, 6).unwrap();
        let response = hosts().compose(&query);

        assert_eq!(response.answer_count(), 0);
        assert_eq!(response.response_code(), crate::op::ResponseCode::NoError);
    }
}

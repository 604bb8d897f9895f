//! Readers for the kernel socket tables (`net/tcp`, `net/tcp6`, `net/udp`,
//! `net/udp6`).
//!
//! Addresses are printed by the kernel as hex words in host byte order.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use conntrail_common::types::Protocol;

/// Kernel state number of a listening TCP socket.
pub const TCP_LISTEN: u8 = 0x0A;

/// One socket table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEntry {
    /// Local endpoint of the socket.
    pub local: SocketAddr,
    /// Peer endpoint; all zeroes for listening and unconnected sockets.
    pub remote: SocketAddr,
    /// Kernel socket state (`st` column).
    pub state: u8,
    /// Owner of the socket.
    pub uid: u32,
    /// Socket inode; zero while the socket is not yet hashed or is in
    /// `TIME_WAIT`.
    pub inode: u64,
}

impl SocketEntry {
    /// Returns whether the socket has no peer.
    pub fn is_unconnected(&self) -> bool {
        self.remote.port() == 0 && self.remote.ip().is_unspecified()
    }
}

/// Table files holding sockets of the given protocol.
pub const fn table_names(protocol: Protocol) -> [&'static str; 2] {
    match protocol {
        Protocol::Tcp => ["net/tcp", "net/tcp6"],
        Protocol::Udp => ["net/udp", "net/udp6"],
    }
}

/// Parses a socket table, skipping the header and unparsable rows.
pub fn parse_table(text: &str) -> impl Iterator<Item = SocketEntry> + '_ {
    text.lines().skip(1).filter_map(parse_row)
}

fn parse_row(line: &str) -> Option<SocketEntry> {
    // sl local rem st tx:rx tr:when retrnsmt uid timeout inode
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    Some(SocketEntry {
        local: parse_endpoint(fields[1])?,
        remote: parse_endpoint(fields[2])?,
        state: u8::from_str_radix(fields[3], 16).ok()?,
        uid: fields[7].parse().ok()?,
        inode: fields[9].parse().ok()?,
    })
}

fn parse_endpoint(text: &str) -> Option<SocketAddr> {
    let (address, port) = text.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match address.len() {
        8 => IpAddr::V4(Ipv4Addr::from(parse_word(address)?.to_ne_bytes())),
        32 => {
            let mut octets = [0_u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let word = address.get(i * 8..i * 8 + 8)?;
                chunk.copy_from_slice(&parse_word(word)?.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn parse_word(hex: &str) -> Option<u32> {
    u32::from_str_radix(hex, 16).ok()
}

/// How well a socket matches a connection endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchQuality {
    /// Listening or unconnected socket bound to the wildcard address.
    Wildcard,
    /// Listening or unconnected socket bound to the endpoint's address.
    Bound,
    /// Socket whose local and peer endpoints both match.
    Connected,
}

fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port() && a.ip().to_canonical() == b.ip().to_canonical()
}

/// All sockets of one protocol, read in one pass over its tables.
#[derive(Debug, Clone)]
pub struct SocketTable {
    protocol: Protocol,
    entries: Vec<SocketEntry>,
}

impl SocketTable {
    /// Wraps already parsed entries.
    pub const fn new(protocol: Protocol, entries: Vec<SocketEntry>) -> Self {
        Self { protocol, entries }
    }

    /// Reads every socket of `protocol` under `proc_root`. Missing tables (no
    /// IPv6 support) are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing table cannot be read.
    pub fn read(proc_root: &Path, protocol: Protocol) -> io::Result<Self> {
        let mut entries = Vec::new();
        for name in table_names(protocol) {
            match std::fs::read_to_string(proc_root.join(name)) {
                Ok(text) => entries.extend(parse_table(&text)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Self::new(protocol, entries))
    }

    /// Protocol of the sockets in this table.
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Parsed rows.
    pub fn entries(&self) -> &[SocketEntry] {
        &self.entries
    }

    /// Returns whether `ip` is an address of this host: loopback, or the
    /// explicit local address of some socket.
    pub fn is_local(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        ip.is_loopback()
            || self
                .entries
                .iter()
                .any(|entry| entry.local.ip().to_canonical() == ip)
    }

    fn is_bound(&self, entry: &SocketEntry) -> bool {
        match self.protocol {
            Protocol::Tcp => entry.state == TCP_LISTEN,
            Protocol::Udp => entry.is_unconnected(),
        }
    }

    fn match_quality(&self, entry: &SocketEntry, local: SocketAddr, peer: Option<SocketAddr>) -> Option<MatchQuality> {
        if entry.local.port() != local.port() {
            return None;
        }
        let bound = self.is_bound(entry);
        let socket_ip = entry.local.ip().to_canonical();
        if socket_ip == local.ip().to_canonical() {
            match peer {
                Some(peer) if same_endpoint(entry.remote, peer) => Some(MatchQuality::Connected),
                None if !bound => Some(MatchQuality::Connected),
                _ if bound => Some(MatchQuality::Bound),
                _ => None,
            }
        } else if socket_ip.is_unspecified() && bound {
            Some(MatchQuality::Wildcard)
        } else {
            None
        }
    }

    /// Picks the socket owning the `local` side of a connection with `peer`.
    ///
    /// A connected socket matching both endpoints wins over a listening or
    /// unconnected one bound to `local`, which wins over one bound to the
    /// wildcard address. Wildcard sockets are only considered when `local`
    /// is an address of this host; without a peer the caller vouches for
    /// that. Among equally good matches, one with a known inode wins.
    pub fn find(&self, local: SocketAddr, peer: Option<SocketAddr>) -> Option<SocketEntry> {
        let wildcard_allowed = peer.is_none() || self.is_local(local.ip());
        self.entries
            .iter()
            .filter_map(|entry| {
                self.match_quality(entry, local, peer)
                    .filter(|quality| *quality != MatchQuality::Wildcard || wildcard_allowed)
                    .map(|quality| (quality, entry.inode != 0, *entry))
            })
            .max_by_key(|(quality, has_inode, _)| (*quality, *has_inode))
            .map(|(_, _, entry)| entry)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{HEADER, row};
    use super::*;

    fn addr(text: &str) -> SocketAddr {
        text.parse().expect("socket address")
    }

    fn entry(local: &str, remote: &str, state: u8, inode: u64) -> SocketEntry {
        SocketEntry {
            local: addr(local),
            remote: addr(remote),
            state,
            uid: 0,
            inode,
        }
    }

    #[test]
    fn parses_kernel_ipv4_row() {
        // Little-endian rendering of 172.16.144.102:59325 -> 104.197.3.80:80.
        let text = format!(
            "{HEADER}\n   0: 669010AC:E7BD 5003C568:0050 01 00000000:00000000 00:00000000 00000000     0        0 1227937 1 0000000000000000 20 4 30 10 -1\n"
        );
        let entries: Vec<SocketEntry> = parse_table(&text).collect();
        if cfg!(target_endian = "little") {
            assert_eq!(entries[0].local, addr("172.16.144.102:59325"));
            assert_eq!(entries[0].remote, addr("104.197.3.80:80"));
        }
        assert_eq!(entries[0].state, 0x01);
        assert_eq!(entries[0].uid, 0);
        assert_eq!(entries[0].inode, 1_227_937);
    }

    #[test]
    fn fixture_rows_round_trip_through_parser() {
        let text = format!(
            "{HEADER}\n{}\n{}\n",
            row(0, addr("10.1.2.3:443"), addr("10.9.9.9:51000"), 0x01, 1000, 42),
            row(1, addr("[2001:db8::7]:8080"), addr("[::]:0"), TCP_LISTEN, 33, 43),
        );
        let entries: Vec<SocketEntry> = parse_table(&text).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].local, addr("10.1.2.3:443"));
        assert_eq!(entries[0].remote, addr("10.9.9.9:51000"));
        assert_eq!(entries[1].local, addr("[2001:db8::7]:8080"));
        assert_eq!(entries[1].state, TCP_LISTEN);
        assert!(entries[1].is_unconnected());
        assert_eq!(entries[1].uid, 33);
    }

    #[test]
    fn skips_short_rows() {
        let text = format!("{HEADER}\n   0: 0100007F:0035\n");
        assert_eq!(parse_table(&text).count(), 0);
    }

    #[test]
    fn exact_match_beats_wildcard() {
        let table = SocketTable::new(
            Protocol::Udp,
            vec![
                entry("0.0.0.0:5353", "0.0.0.0:0", 0x07, 1),
                entry("192.168.1.4:5353", "0.0.0.0:0", 0x07, 2),
            ],
        );
        assert_eq!(table.find(addr("192.168.1.4:5353"), None).map(|e| e.inode), Some(2));
        assert_eq!(table.find(addr("10.0.0.1:5353"), None).map(|e| e.inode), Some(1));
        assert!(table.find(addr("10.0.0.1:53"), None).is_none());
    }

    #[test]
    fn tcp_matches_local_and_peer() {
        let table = SocketTable::new(
            Protocol::Tcp,
            vec![
                entry("0.0.0.0:22", "0.0.0.0:0", TCP_LISTEN, 10),
                entry("10.0.0.8:22", "10.0.0.50:51000", 0x01, 11),
                entry("10.0.0.8:22", "10.0.0.51:52000", 0x01, 12),
            ],
        );
        let found = table.find(addr("10.0.0.8:22"), Some(addr("10.0.0.51:52000")));
        assert_eq!(found.map(|e| e.inode), Some(12));
        // No accepted socket for this peer yet: the listener owns it.
        let found = table.find(addr("10.0.0.8:22"), Some(addr("10.0.0.60:53000")));
        assert_eq!(found.map(|e| e.inode), Some(10));
    }

    #[test]
    fn connected_tcp_socket_is_not_a_wildcard() {
        let table = SocketTable::new(
            Protocol::Tcp,
            vec![entry("0.0.0.0:443", "10.0.0.9:60000", 0x01, 5)],
        );
        assert!(table.find(addr("10.0.0.8:443"), None).is_none());
    }

    #[test]
    fn wildcard_needs_a_local_address() {
        let table = SocketTable::new(
            Protocol::Tcp,
            vec![entry("0.0.0.0:443", "0.0.0.0:0", TCP_LISTEN, 77)],
        );
        assert!(!table.is_local(addr("93.184.216.34:443").ip()));
        assert!(table.find(addr("93.184.216.34:443"), Some(addr("10.0.0.8:40000"))).is_none());
        assert!(table.is_local(addr("127.0.0.1:443").ip()));
        assert_eq!(
            table
                .find(addr("127.0.0.1:443"), Some(addr("127.0.0.1:40000")))
                .map(|e| e.inode),
            Some(77)
        );
    }

    #[test]
    fn connected_udp_socket_ignores_other_peers() {
        let table = SocketTable::new(
            Protocol::Udp,
            vec![entry("10.0.0.8:40000", "10.0.0.53:53", 0x01, 3)],
        );
        assert!(table.find(addr("10.0.0.8:40000"), Some(addr("10.0.0.54:53"))).is_none());
        assert_eq!(
            table.find(addr("10.0.0.8:40000"), Some(addr("10.0.0.53:53"))).map(|e| e.inode),
            Some(3)
        );
    }

    #[test]
    fn ipv4_mapped_socket_matches_ipv4_endpoint() {
        let table = SocketTable::new(
            Protocol::Tcp,
            vec![entry("[::ffff:10.0.0.8]:22", "[::ffff:10.0.0.50]:51000", 0x01, 9)],
        );
        let found = table.find(addr("10.0.0.8:22"), Some(addr("10.0.0.50:51000")));
        assert_eq!(found.map(|e| e.inode), Some(9));
    }

    #[test]
    fn missing_tables_yield_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = SocketTable::read(dir.path(), Protocol::Tcp).expect("read");
        assert!(table.entries().is_empty());
        assert_eq!(table.protocol(), Protocol::Tcp);
    }
}

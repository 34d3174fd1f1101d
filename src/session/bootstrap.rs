//! Session identifiers.
//!
//! A session id is the host's dialable multiaddr ending in `/p2p/<peer id>`.
//! It is exchanged out of band (read aloud, pasted, QR) and is all an
//! operator needs to join.

use std::fmt;
use std::str::FromStr;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId {
    addr: Multiaddr,
    host: PeerId,
}

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self, ConnectionError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConnectionError::MalformedSessionId("empty session id".to_string()));
        }
        let addr = Multiaddr::from_str(raw)
            .map_err(|e| ConnectionError::MalformedSessionId(format!("{}: {}", raw, e)))?;
        let host = peer_of(&addr).ok_or_else(|| {
            ConnectionError::MalformedSessionId(format!("{} has no /p2p/ component", raw))
        })?;
        if !addr.iter().any(|p| is_transport(&p)) {
            return Err(ConnectionError::MalformedSessionId(format!(
                "{} has no dialable address",
                raw
            )));
        }
        Ok(Self { addr, host })
    }

    /// Build the id a host advertises for one of its listen addresses.
    pub fn for_listen_addr(addr: &Multiaddr, host: PeerId) -> Self {
        let addr = match peer_of(addr) {
            Some(_) => addr.clone(),
            None => addr.clone().with(Protocol::P2p(host)),
        };
        Self { addr, host }
    }

    pub fn host_peer_id(&self) -> PeerId {
        self.host
    }

    pub fn addr(&self) -> &Multiaddr {
        &self.addr
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| {
        if let Protocol::P2p(id) = p {
            Some(id)
        } else {
            None
        }
    })
}

fn is_transport(p: &Protocol<'_>) -> bool {
    matches!(
        p,
        Protocol::Tcp(_) | Protocol::Udp(_) | Protocol::QuicV1 | Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_)
    )
}

/// Pick the listen address to advertise: routable IPv4 first, then any
/// non-loopback, then loopback. Unspecified addresses are never advertised.
pub fn pick_advertised(addrs: &[Multiaddr]) -> Option<&Multiaddr> {
    let rank = |addr: &Multiaddr| -> Option<u8> {
        match addr.iter().next()? {
            Protocol::Ip4(ip) if ip.is_unspecified() => None,
            Protocol::Ip6(ip) if ip.is_unspecified() => None,
            Protocol::Ip4(ip) if ip.is_loopback() => Some(3),
            Protocol::Ip6(ip) if ip.is_loopback() => Some(3),
            Protocol::Ip4(_) => {
                // Prefer TCP so the id works without QUIC.
                if addr.iter().any(|p| matches!(p, Protocol::Tcp(_))) {
                    Some(0)
                } else {
                    Some(1)
                }
            }
            _ => Some(2),
        }
    };
    addrs
        .iter()
        .filter_map(|a| rank(a).map(|r| (r, a)))
        .min_by_key(|(r, _)| *r)
        .map(|(_, a)| a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn peer() -> PeerId {
        PeerId::from(Keypair::generate_ed25519().public())
    }

    #[test]
    fn test_parse_round_trips_display() {
        let host = peer();
        let raw = format!("/ip4/192.168.1.20/tcp/4001/p2p/{}", host);
        let id = SessionId::parse(&raw).unwrap();
        assert_eq!(id.host_peer_id(), host);
        assert_eq!(id.to_string(), raw);
        assert_eq!(SessionId::parse(&format!("  {}\n", raw)).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let host = peer();
        for raw in [
            "".to_string(),
            "not-a-multiaddr".to_string(),
            "/ip4/10.0.0.1/tcp/4001".to_string(),
            format!("/p2p/{}", host),
        ] {
            assert!(
                matches!(SessionId::parse(&raw), Err(ConnectionError::MalformedSessionId(_))),
                "accepted {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_for_listen_addr_appends_peer_once() {
        let host = peer();
        let addr: Multiaddr = "/ip4/10.0.0.5/udp/9000/quic-v1".parse().unwrap();
        let id = SessionId::for_listen_addr(&addr, host);
        assert_eq!(id.to_string(), format!("/ip4/10.0.0.5/udp/9000/quic-v1/p2p/{}", host));

        let again = SessionId::for_listen_addr(id.addr(), host);
        assert_eq!(again, id);
    }

    #[test]
    fn test_pick_advertised_prefers_lan_tcp() {
        let addrs: Vec<Multiaddr> = [
            "/ip4/127.0.0.1/tcp/4001",
            "/ip4/0.0.0.0/tcp/4001",
            "/ip4/192.168.1.20/udp/4001/quic-v1",
            "/ip4/192.168.1.20/tcp/4001",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
        assert_eq!(pick_advertised(&addrs).unwrap(), &addrs[3]);
        assert_eq!(pick_advertised(&addrs[..1]).unwrap(), &addrs[0]);
        assert!(pick_advertised(&addrs[1..2]).is_none());
    }
}

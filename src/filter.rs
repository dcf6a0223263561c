use anyhow::{Context, bail};
use std::net::{IpAddr, Ipv4Addr};

use crate::packet::{Packet, Transport};

/// The slice of BPF the deployments actually write: protocol keywords,
/// `host`/`net`/`port` primitives and `and`/`or`/`not` with parentheses.
/// Anything else is a configuration error at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketFilter {
    Tcp,
    Udp,
    Host(IpAddr),
    Net { addr: Ipv4Addr, prefix: u8 },
    Port(u16),
    Not(Box<PacketFilter>),
    And(Box<PacketFilter>, Box<PacketFilter>),
    Or(Box<PacketFilter>, Box<PacketFilter>),
}

impl PacketFilter {
    pub fn parse(expr: &str) -> anyhow::Result<PacketFilter> {
        let tokens: Vec<String> = expr
            .replace('(', " ( ")
            .replace(')', " ) ")
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            bail!("empty filter expression");
        }

        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            bail!("trailing tokens after {:?}", parser.tokens[parser.pos]);
        }
        Ok(filter)
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        match self {
            PacketFilter::Tcp => matches!(packet.transport, Some(Transport::Tcp { .. })),
            PacketFilter::Udp => matches!(packet.transport, Some(Transport::Udp { .. })),
            PacketFilter::Host(addr) => packet.net.src() == *addr || packet.net.dst() == *addr,
            PacketFilter::Net { addr, prefix } => {
                in_net(packet.net.src(), *addr, *prefix) || in_net(packet.net.dst(), *addr, *prefix)
            }
            PacketFilter::Port(port) => {
                let (src, dst) = match &packet.transport {
                    Some(Transport::Tcp { header, .. }) => {
                        (header.source_port, header.destination_port)
                    }
                    Some(Transport::Udp { header, .. }) => {
                        (header.source_port, header.destination_port)
                    }
                    None => return false,
                };
                src == *port || dst == *port
            }
            PacketFilter::Not(inner) => !inner.matches(packet),
            PacketFilter::And(a, b) => a.matches(packet) && b.matches(packet),
            PacketFilter::Or(a, b) => a.matches(packet) || b.matches(packet),
        }
    }
}

fn in_net(ip: IpAddr, net: Ipv4Addr, prefix: u8) -> bool {
    let IpAddr::V4(ip) = ip else {
        return false;
    };
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix.min(32) as u32);
    (u32::from(ip) & mask) == (u32::from(net) & mask)
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> anyhow::Result<String> {
        let token = self
            .tokens
            .get(self.pos)
            .context("unexpected end of filter expression")?
            .clone();
        self.pos += 1;
        Ok(token)
    }

    fn or_expr(&mut self) -> anyhow::Result<PacketFilter> {
        let mut left = self.and_expr()?;
        while self.peek() == Some("or") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = PacketFilter::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> anyhow::Result<PacketFilter> {
        let mut left = self.term()?;
        while self.peek() == Some("and") {
            self.pos += 1;
            let right = self.term()?;
            left = PacketFilter::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> anyhow::Result<PacketFilter> {
        match self.next()?.as_str() {
            "not" => Ok(PacketFilter::Not(Box::new(self.term()?))),
            "(" => {
                let inner = self.or_expr()?;
                match self.next()?.as_str() {
                    ")" => Ok(inner),
                    other => bail!("expected ')', found {other:?}"),
                }
            }
            "tcp" => Ok(PacketFilter::Tcp),
            "udp" => Ok(PacketFilter::Udp),
            "host" => {
                let addr = self.next()?;
                Ok(PacketFilter::Host(
                    addr.parse().with_context(|| format!("bad host {addr:?}"))?,
                ))
            }
            "net" => {
                let spec = self.next()?;
                let (addr, prefix) = spec
                    .split_once('/')
                    .with_context(|| format!("bad net {spec:?}, expected a.b.c.d/len"))?;
                let prefix: u8 = prefix.parse().with_context(|| format!("bad prefix in {spec:?}"))?;
                if prefix > 32 {
                    bail!("prefix length {prefix} out of range");
                }
                Ok(PacketFilter::Net {
                    addr: addr.parse().with_context(|| format!("bad net {spec:?}"))?,
                    prefix,
                })
            }
            "port" => {
                let port = self.next()?;
                Ok(PacketFilter::Port(
                    port.parse().with_context(|| format!("bad port {port:?}"))?,
                ))
            }
            other => bail!("unsupported filter token {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use etherparse::{IpNumber, Ipv4Header, TcpHeader, UdpHeader};

    fn tcp_packet(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Packet {
        Packet {
            time: Utc::now(),
            net: crate::packet::Net::V4 {
                header: Ipv4Header::new(0, 64, IpNumber::TCP, src, dst).unwrap(),
                payload: Bytes::new(),
            },
            transport: Some(Transport::Tcp {
                header: TcpHeader::new(sport, dport, 0, 65535),
                payload: Bytes::new(),
            }),
        }
    }

    fn udp_packet(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Packet {
        Packet {
            time: Utc::now(),
            net: crate::packet::Net::V4 {
                header: Ipv4Header::new(0, 64, IpNumber::UDP, src, dst).unwrap(),
                payload: Bytes::new(),
            },
            transport: Some(Transport::Udp {
                header: UdpHeader {
                    source_port: sport,
                    destination_port: dport,
                    length: 8,
                    checksum: 0,
                },
                payload: Bytes::new(),
            }),
        }
    }

    #[test]
    fn protocol_and_port_terms() {
        let filter = PacketFilter::parse("tcp and port 1337").unwrap();
        assert!(filter.matches(&tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 40000, 1337)));
        assert!(!filter.matches(&tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80)));
        assert!(!filter.matches(&udp_packet([10, 0, 0, 1], [10, 0, 0, 2], 40000, 1337)));
    }

    #[test]
    fn host_matches_either_side() {
        let filter = PacketFilter::parse("host 10.0.0.7").unwrap();
        assert!(filter.matches(&tcp_packet([10, 0, 0, 7], [10, 0, 0, 2], 1, 2)));
        assert!(filter.matches(&tcp_packet([10, 0, 0, 2], [10, 0, 0, 7], 1, 2)));
        assert!(!filter.matches(&tcp_packet([10, 0, 0, 2], [10, 0, 0, 3], 1, 2)));
    }

    #[test]
    fn nets_and_precedence() {
        let filter = PacketFilter::parse("net 10.32.0.0/16 and (tcp or udp) and not port 22").unwrap();
        assert!(filter.matches(&tcp_packet([10, 32, 1, 2], [10, 32, 4, 4], 5, 1337)));
        assert!(!filter.matches(&tcp_packet([10, 33, 1, 2], [10, 33, 4, 4], 5, 1337)));
        assert!(!filter.matches(&tcp_packet([10, 32, 1, 2], [10, 32, 4, 4], 22, 5)));
    }

    #[test]
    fn unsupported_syntax_is_an_error() {
        assert!(PacketFilter::parse("vlan 100").is_err());
        assert!(PacketFilter::parse("tcp and").is_err());
        assert!(PacketFilter::parse("(tcp").is_err());
        assert!(PacketFilter::parse("").is_err());
        assert!(PacketFilter::parse("net 10.0.0.0/64").is_err());
    }
}

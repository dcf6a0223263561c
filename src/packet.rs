use anyhow::anyhow;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use etherparse::{IpNumber, Ipv4Header, NetHeaders, PacketHeaders, TcpHeader, TransportHeader, UdpHeader};
use pcap_file::DataLink;
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub enum Net {
    V4 {
        header: Ipv4Header,
        /// IP payload; only read when the transport layer is absent
        /// (fragments awaiting reassembly).
        payload: Bytes,
    },
    V6 {
        src: IpAddr,
        dst: IpAddr,
    },
}

impl Net {
    pub fn src(&self) -> IpAddr {
        match self {
            Net::V4 { header, .. } => IpAddr::from(header.source),
            Net::V6 { src, .. } => *src,
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            Net::V4 { header, .. } => IpAddr::from(header.destination),
            Net::V6 { dst, .. } => *dst,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Transport {
    Tcp { header: TcpHeader, payload: Bytes },
    Udp { header: UdpHeader, payload: Bytes },
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub time: DateTime<Utc>,
    pub net: Net,
    pub transport: Option<Transport>,
}

/// Decodes one captured frame down to its transport layer. Non-IP frames
/// decode to `None` and are dropped from the pipeline.
pub fn decode(datalink: DataLink, data: &[u8], time: DateTime<Utc>) -> anyhow::Result<Option<Packet>> {
    let headers = match datalink {
        DataLink::ETHERNET => PacketHeaders::from_ethernet_slice(data),
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => PacketHeaders::from_ip_slice(data),
        other => return Err(anyhow!("unsupported link type {:?}", other)),
    }
    .map_err(|e| anyhow!("failed to decode frame: {e}"))?;

    let net = match headers.net {
        Some(NetHeaders::Ipv4(header, _)) => Net::V4 {
            payload: Bytes::copy_from_slice(headers.payload.slice()),
            header,
        },
        Some(NetHeaders::Ipv6(header, _)) => Net::V6 {
            src: IpAddr::from(header.source),
            dst: IpAddr::from(header.destination),
        },
        _ => return Ok(None),
    };

    let transport = match headers.transport {
        Some(TransportHeader::Tcp(header)) => Some(Transport::Tcp {
            header,
            payload: Bytes::copy_from_slice(headers.payload.slice()),
        }),
        Some(TransportHeader::Udp(header)) => Some(Transport::Udp {
            header,
            payload: Bytes::copy_from_slice(headers.payload.slice()),
        }),
        _ => None,
    };

    Ok(Some(Packet { time, net, transport }))
}

/// Parses the transport layer out of a reassembled IP payload.
pub fn parse_transport(protocol: IpNumber, data: &[u8]) -> Option<Transport> {
    match protocol {
        IpNumber::TCP => {
            let (header, payload) = TcpHeader::from_slice(data).ok()?;
            Some(Transport::Tcp {
                header,
                payload: Bytes::copy_from_slice(payload),
            })
        }
        IpNumber::UDP => {
            let (header, payload) = UdpHeader::from_slice(data).ok()?;
            Some(Transport::Udp {
                header,
                payload: Bytes::copy_from_slice(payload),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn decodes_ethernet_tcp() {
        let builder = PacketBuilder::ethernet2([0x11; 6], [0x22; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(40000, 9999, 1000, 65535)
            .psh()
            .ack(1);
        let mut frame = Vec::with_capacity(builder.size(5));
        builder.write(&mut frame, b"hello").unwrap();

        let packet = decode(DataLink::ETHERNET, &frame, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(packet.net.src(), "10.0.0.1".parse::<IpAddr>().unwrap());
        match packet.transport {
            Some(Transport::Tcp { header, payload }) => {
                assert_eq!(header.destination_port, 9999);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("expected tcp transport, got {:?}", other),
        }
    }

    #[test]
    fn non_ip_frames_are_dropped() {
        // ARP ethertype
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08;
        frame[13] = 0x06;
        let packet = decode(DataLink::ETHERNET, &frame, Utc::now()).unwrap();
        assert!(packet.is_none());
    }
}

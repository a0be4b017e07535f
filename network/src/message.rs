//! Framed wire messages of protocol version 3.
//!
//! Every frame is `magic || command(12, NUL-padded ASCII) ||
//! length(u32) || checksum(first 4 of sha512(payload)) || payload`.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bitmessage_core::codec::{
    put_u16, put_u32, put_u64, put_var_int, put_var_int_list, put_var_str, Decoder,
    MAX_PAYLOAD_SIZE,
};
use bitmessage_core::{CoreError, CoreResult, Cryptography, InventoryVector};

pub const MAGIC: u32 = 0xE9BE_B4D9;
pub const HEADER_LENGTH: usize = 24;

/// Wire protocol version we speak and the floor we accept.
pub const PROTOCOL_VERSION: u32 = 3;
pub const MIN_PROTOCOL_VERSION: u32 = 3;

/// Services bitfield: a full node relaying objects.
pub const NODE_NETWORK: u64 = 1;

/// Hard per-message entry limits.
pub const MAX_INV_ENTRIES: usize = 50_000;
pub const MAX_ADDR_ENTRIES: usize = 1000;
pub const MAX_STREAMS: usize = 160_000;

const COMMAND_LENGTH: usize = 12;
const MAX_USER_AGENT: usize = 5000;

/// A peer endpoint as carried in `addr` messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub time: u64,
    pub stream: u64,
    pub services: u64,
    pub addr: SocketAddr,
}

impl NetworkAddress {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.time);
        put_u32(buf, self.stream as u32);
        encode_endpoint(buf, self.services, &self.addr);
    }

    fn decode(dec: &mut Decoder<'_>) -> CoreResult<Self> {
        let time = dec.u64()?;
        let stream = dec.u32()? as u64;
        let (services, addr) = decode_endpoint(dec)?;
        Ok(NetworkAddress {
            time,
            stream,
            services,
            addr,
        })
    }
}

/// The short endpoint form inside version messages: no time, no stream.
fn encode_endpoint(buf: &mut Vec<u8>, services: u64, addr: &SocketAddr) {
    put_u64(buf, services);
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    buf.extend_from_slice(&ip.octets());
    put_u16(buf, addr.port());
}

fn decode_endpoint(dec: &mut Decoder<'_>) -> CoreResult<(u64, SocketAddr)> {
    let services = dec.u64()?;
    let octets = dec.array::<16>()?;
    let v6 = Ipv6Addr::from(octets);
    let ip = match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    };
    let port = dec.u16()?;
    Ok((services, SocketAddr::new(ip, port)))
}

/// The handshake announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver_services: u64,
    pub receiver: SocketAddr,
    pub sender_services: u64,
    pub sender: SocketAddr,
    /// Random per-node value used to detect connections to ourselves.
    pub nonce: u64,
    pub user_agent: String,
    pub streams: Vec<u64>,
}

impl VersionPayload {
    pub fn new(
        receiver: SocketAddr,
        sender: SocketAddr,
        nonce: u64,
        timestamp: i64,
        user_agent: &str,
        streams: &[u64],
    ) -> Self {
        VersionPayload {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp,
            receiver_services: NODE_NETWORK,
            receiver,
            sender_services: NODE_NETWORK,
            sender,
            nonce,
            user_agent: user_agent.to_owned(),
            streams: streams.to_vec(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.version);
        put_u64(buf, self.services);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        encode_endpoint(buf, self.receiver_services, &self.receiver);
        encode_endpoint(buf, self.sender_services, &self.sender);
        put_u64(buf, self.nonce);
        put_var_str(buf, &self.user_agent);
        put_var_int_list(buf, &self.streams);
    }

    fn decode(dec: &mut Decoder<'_>) -> CoreResult<Self> {
        let version = dec.u32()?;
        let services = dec.u64()?;
        let timestamp = dec.i64()?;
        let (receiver_services, receiver) = decode_endpoint(dec)?;
        let (sender_services, sender) = decode_endpoint(dec)?;
        let nonce = dec.u64()?;
        let user_agent = dec.var_str(MAX_USER_AGENT)?;
        let streams = dec.var_int_list(MAX_STREAMS)?;
        Ok(VersionPayload {
            version,
            services,
            timestamp,
            receiver_services,
            receiver,
            sender_services,
            sender,
            nonce,
            user_agent,
            streams,
        })
    }
}

/// The six commands a session exchanges once connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionPayload),
    Verack,
    Addr(Vec<NetworkAddress>),
    Inv(Vec<InventoryVector>),
    GetData(Vec<InventoryVector>),
    /// A raw object; validation happens in the inventory, not here.
    Object(Vec<u8>),
}

impl NetworkMessage {
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::Object(_) => "object",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            NetworkMessage::Version(version) => version.encode(&mut buf),
            NetworkMessage::Verack => {}
            NetworkMessage::Addr(addresses) => {
                put_var_int(&mut buf, addresses.len() as u64);
                for address in addresses {
                    address.encode(&mut buf);
                }
            }
            NetworkMessage::Inv(vectors) | NetworkMessage::GetData(vectors) => {
                put_var_int(&mut buf, vectors.len() as u64);
                for iv in vectors {
                    buf.extend_from_slice(iv.as_bytes());
                }
            }
            NetworkMessage::Object(bytes) => buf.extend_from_slice(bytes),
        }
        buf
    }

    pub fn decode_payload(command: &str, payload: &[u8]) -> CoreResult<Self> {
        let mut dec = Decoder::new(payload);
        let message = match command {
            "version" => NetworkMessage::Version(VersionPayload::decode(&mut dec)?),
            "verack" => NetworkMessage::Verack,
            "addr" => {
                let count = dec.var_int()?;
                if count > MAX_ADDR_ENTRIES as u64 {
                    return Err(CoreError::ProtocolViolation(format!(
                        "addr with {} entries",
                        count
                    )));
                }
                let mut addresses = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    addresses.push(NetworkAddress::decode(&mut dec)?);
                }
                NetworkMessage::Addr(addresses)
            }
            "inv" | "getdata" => {
                let count = dec.var_int()?;
                if count > MAX_INV_ENTRIES as u64 {
                    return Err(CoreError::ProtocolViolation(format!(
                        "{} with {} entries",
                        command, count
                    )));
                }
                let mut vectors = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    vectors.push(InventoryVector(dec.array()?));
                }
                if command == "inv" {
                    NetworkMessage::Inv(vectors)
                } else {
                    NetworkMessage::GetData(vectors)
                }
            }
            "object" => return Ok(NetworkMessage::Object(payload.to_vec())),
            other => {
                return Err(CoreError::parse(format!("unknown command {:?}", other)));
            }
        };
        dec.finish()?;
        Ok(message)
    }

    /// Serializes the full frame, header included.
    pub fn encode_frame(&self, crypto: &dyn Cryptography) -> Vec<u8> {
        let payload = self.encode_payload();
        let checksum = crypto.sha512(&[&payload]);

        let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len());
        put_u32(&mut frame, MAGIC);
        let mut command = [0u8; COMMAND_LENGTH];
        command[..self.command().len()].copy_from_slice(self.command().as_bytes());
        frame.extend_from_slice(&command);
        put_u32(&mut frame, payload.len() as u32);
        frame.extend_from_slice(&checksum[..4]);
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Parsed frame header; the payload follows on the wire.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub command: String,
    pub length: usize,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    pub fn decode(bytes: &[u8; HEADER_LENGTH]) -> CoreResult<Self> {
        let mut dec = Decoder::new(bytes);
        let magic = dec.u32()?;
        if magic != MAGIC {
            return Err(CoreError::ProtocolViolation(format!(
                "bad magic 0x{:08X}",
                magic
            )));
        }
        let raw_command = dec.bytes(COMMAND_LENGTH)?;
        let trimmed: Vec<u8> = raw_command.iter().copied().take_while(|b| *b != 0).collect();
        let command = String::from_utf8(trimmed)
            .map_err(|_| CoreError::parse("command is not ASCII"))?;
        let length = dec.u32()? as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(CoreError::Oversize(length));
        }
        let checksum = dec.array::<4>()?;
        Ok(FrameHeader {
            command,
            length,
            checksum,
        })
    }

    pub fn verify_checksum(&self, crypto: &dyn Cryptography, payload: &[u8]) -> CoreResult<()> {
        let digest = crypto.sha512(&[payload]);
        if digest[..4] == self.checksum {
            Ok(())
        } else {
            Err(CoreError::ChecksumMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitmessage_core::DefaultCryptography;

    fn sample_version() -> VersionPayload {
        VersionPayload::new(
            "203.0.113.5:8444".parse().unwrap(),
            "198.51.100.7:8444".parse().unwrap(),
            0xDEAD_BEEF_CAFE_F00D,
            1_700_000_000,
            "/bitmessage-rust:0.1.0/",
            &[1],
        )
    }

    fn round_trip(message: NetworkMessage) -> NetworkMessage {
        let crypto = DefaultCryptography::new();
        let frame = message.encode_frame(&crypto);

        let header =
            FrameHeader::decode(&frame[..HEADER_LENGTH].try_into().unwrap()).unwrap();
        assert_eq!(header.command, message.command());
        let payload = &frame[HEADER_LENGTH..];
        assert_eq!(payload.len(), header.length);
        header.verify_checksum(&crypto, payload).unwrap();
        NetworkMessage::decode_payload(&header.command, payload).unwrap()
    }

    #[test]
    fn version_frame_round_trip_is_bit_identical() {
        let crypto = DefaultCryptography::new();
        let message = NetworkMessage::Version(sample_version());
        let frame = message.encode_frame(&crypto);
        let decoded = round_trip(message.clone());
        assert_eq!(decoded, message);
        assert_eq!(decoded.encode_frame(&crypto), frame);
    }

    #[test]
    fn verack_is_empty() {
        let decoded = round_trip(NetworkMessage::Verack);
        assert_eq!(decoded, NetworkMessage::Verack);
        assert!(NetworkMessage::Verack.encode_payload().is_empty());
    }

    #[test]
    fn inv_and_getdata_round_trip() {
        let vectors = vec![InventoryVector([1; 32]), InventoryVector([2; 32])];
        assert_eq!(
            round_trip(NetworkMessage::Inv(vectors.clone())),
            NetworkMessage::Inv(vectors.clone())
        );
        assert_eq!(
            round_trip(NetworkMessage::GetData(vectors.clone())),
            NetworkMessage::GetData(vectors)
        );
    }

    #[test]
    fn addr_round_trip_keeps_ipv4_and_ipv6() {
        let addresses = vec![
            NetworkAddress {
                time: 1_700_000_000,
                stream: 1,
                services: NODE_NETWORK,
                addr: "192.0.2.33:8444".parse().unwrap(),
            },
            NetworkAddress {
                time: 1_700_000_100,
                stream: 2,
                services: NODE_NETWORK,
                addr: "[2001:db8::1]:8445".parse().unwrap(),
            },
        ];
        assert_eq!(
            round_trip(NetworkMessage::Addr(addresses.clone())),
            NetworkMessage::Addr(addresses)
        );
    }

    #[test]
    fn corrupted_checksum_is_detected() {
        let crypto = DefaultCryptography::new();
        let mut frame = NetworkMessage::Verack.encode_frame(&crypto);
        frame[20] ^= 0xFF; // inside the checksum field
        let header =
            FrameHeader::decode(&frame[..HEADER_LENGTH].try_into().unwrap()).unwrap();
        assert!(matches!(
            header.verify_checksum(&crypto, &frame[HEADER_LENGTH..]),
            Err(CoreError::ChecksumMismatch)
        ));
    }

    #[test]
    fn bad_magic_is_a_protocol_violation() {
        let crypto = DefaultCryptography::new();
        let mut frame = NetworkMessage::Verack.encode_frame(&crypto);
        frame[0] = 0;
        let result = FrameHeader::decode(&frame[..HEADER_LENGTH].try_into().unwrap());
        assert!(matches!(result, Err(CoreError::ProtocolViolation(_))));
    }

    #[test]
    fn oversize_length_is_rejected_at_the_header() {
        let crypto = DefaultCryptography::new();
        let mut frame = NetworkMessage::Verack.encode_frame(&crypto);
        frame[16..20].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes());
        let result = FrameHeader::decode(&frame[..HEADER_LENGTH].try_into().unwrap());
        assert!(matches!(result, Err(CoreError::Oversize(_))));
    }

    #[test]
    fn oversized_inv_is_a_protocol_violation() {
        let mut payload = Vec::new();
        put_var_int(&mut payload, MAX_INV_ENTRIES as u64 + 1);
        assert!(matches!(
            NetworkMessage::decode_payload("inv", &payload),
            Err(CoreError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn unknown_command_is_a_parse_error() {
        assert!(matches!(
            NetworkMessage::decode_payload("bogus", &[]),
            Err(CoreError::Parse(_))
        ));
    }
}

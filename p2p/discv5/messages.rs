//! Wire message types, per the spec's external-interfaces section.
//!
//! On the wire a message is `message-type || rlp(message-data)`, where
//! `message-type` is a single byte prepended to (not included in) the RLP list.

use bytes::{Bytes, BytesMut};
use discv5_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use std::fmt;
use std::net::IpAddr;

use crate::types::NodeRecord;

pub const PING_ID: u8 = 0x01;
pub const PONG_ID: u8 = 0x02;
pub const FINDNODE_ID: u8 = 0x03;
pub const NODES_ID: u8 = 0x04;
pub const TALKREQ_ID: u8 = 0x05;
pub const TALKRESP_ID: u8 = 0x06;

/// A FINDNODE message may request at most this many distance buckets at once.
pub const MAX_DISTANCES_PER_FINDNODE: usize = 9;
/// The largest `total` a NODES response may legally declare, per spec §4.4.
pub const MAX_NODES_MESSAGE_TOTAL: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub request_id: Bytes,
    pub enr_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub request_id: Bytes,
    pub enr_seq: u64,
    pub packet_ip: IpAddr,
    pub packet_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    pub request_id: Bytes,
    pub distances: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nodes {
    pub request_id: Bytes,
    pub total: u64,
    pub enrs: Vec<NodeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkRequest {
    pub request_id: Bytes,
    pub protocol: Bytes,
    pub request: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkResponse {
    pub request_id: Bytes,
    pub response: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Nodes(Nodes),
    TalkRequest(TalkRequest),
    TalkResponse(TalkResponse),
}

impl Message {
    pub fn request_id(&self) -> &Bytes {
        match self {
            Message::Ping(m) => &m.request_id,
            Message::Pong(m) => &m.request_id,
            Message::FindNode(m) => &m.request_id,
            Message::Nodes(m) => &m.request_id,
            Message::TalkRequest(m) => &m.request_id,
            Message::TalkResponse(m) => &m.request_id,
        }
    }

    /// True for messages that originate a request and expect a response.
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Ping(_) | Message::FindNode(_) | Message::TalkRequest(_))
    }

    /// True for messages that are themselves a response to an earlier request.
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Pong(_) | Message::Nodes(_) | Message::TalkResponse(_))
    }

    /// The message-type tag, as carried on the wire immediately before the RLP body.
    pub fn type_id(&self) -> u8 {
        match self {
            Message::Ping(_) => PING_ID,
            Message::Pong(_) => PONG_ID,
            Message::FindNode(_) => FINDNODE_ID,
            Message::Nodes(_) => NODES_ID,
            Message::TalkRequest(_) => TALKREQ_ID,
            Message::TalkResponse(_) => TALKRESP_ID,
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[self.type_id()]);
        match self {
            Message::Ping(m) => Encoder::new(&mut buf)
                .encode_field(&m.request_id)
                .encode_field(&m.enr_seq)
                .finish(),
            Message::Pong(m) => Encoder::new(&mut buf)
                .encode_field(&m.request_id)
                .encode_field(&m.enr_seq)
                .encode_field(&m.packet_ip)
                .encode_field(&m.packet_port)
                .finish(),
            Message::FindNode(m) => Encoder::new(&mut buf)
                .encode_field(&m.request_id)
                .encode_field(&m.distances)
                .finish(),
            Message::Nodes(m) => Encoder::new(&mut buf)
                .encode_field(&m.request_id)
                .encode_field(&m.total)
                .encode_field(&m.enrs)
                .finish(),
            Message::TalkRequest(m) => Encoder::new(&mut buf)
                .encode_field(&m.request_id)
                .encode_field(&m.protocol)
                .encode_field(&m.request)
                .finish(),
            Message::TalkResponse(m) => Encoder::new(&mut buf)
                .encode_field(&m.request_id)
                .encode_field(&m.response)
                .finish(),
        }
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RLPDecodeError> {
        let (&type_id, rest) = data
            .split_first()
            .ok_or_else(RLPDecodeError::invalid_length)?;
        match type_id {
            PING_ID => {
                let decoder = Decoder::new(rest)?;
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (enr_seq, decoder) = decoder.decode_field("enr_seq")?;
                decoder.finish()?;
                Ok(Message::Ping(Ping { request_id, enr_seq }))
            }
            PONG_ID => {
                let decoder = Decoder::new(rest)?;
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (enr_seq, decoder) = decoder.decode_field("enr_seq")?;
                let (packet_ip, decoder) = decoder.decode_field("packet_ip")?;
                let (packet_port, decoder) = decoder.decode_field("packet_port")?;
                decoder.finish()?;
                Ok(Message::Pong(Pong {
                    request_id,
                    enr_seq,
                    packet_ip,
                    packet_port,
                }))
            }
            FINDNODE_ID => {
                let decoder = Decoder::new(rest)?;
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (distances, decoder) = decoder.decode_field::<Vec<u16>>("distances")?;
                decoder.finish()?;
                if distances.len() > MAX_DISTANCES_PER_FINDNODE {
                    return Err(RLPDecodeError::Custom(
                        "too many distances in FINDNODE message".into(),
                    ));
                }
                Ok(Message::FindNode(FindNode { request_id, distances }))
            }
            NODES_ID => {
                let decoder = Decoder::new(rest)?;
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (total, decoder) = decoder.decode_field("total")?;
                let (enrs, decoder) = decoder.decode_field("enrs")?;
                decoder.finish()?;
                Ok(Message::Nodes(Nodes { request_id, total, enrs }))
            }
            TALKREQ_ID => {
                let decoder = Decoder::new(rest)?;
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (protocol, decoder) = decoder.decode_field("protocol")?;
                let (request, decoder) = decoder.decode_field("request")?;
                decoder.finish()?;
                Ok(Message::TalkRequest(TalkRequest {
                    request_id,
                    protocol,
                    request,
                }))
            }
            TALKRESP_ID => {
                let decoder = Decoder::new(rest)?;
                let (request_id, decoder) = decoder.decode_field("request_id")?;
                let (response, decoder) = decoder.decode_field("response")?;
                decoder.finish()?;
                Ok(Message::TalkResponse(TalkResponse { request_id, response }))
            }
            other => Err(RLPDecodeError::Custom(format!(
                "unknown discv5 message type 0x{other:02x}"
            ))),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Ping(_) => write!(f, "Ping"),
            Message::Pong(_) => write!(f, "Pong"),
            Message::FindNode(_) => write!(f, "FindNode"),
            Message::Nodes(m) => write!(f, "Nodes(total={})", m.total),
            Message::TalkRequest(_) => write!(f, "TalkRequest"),
            Message::TalkResponse(_) => write!(f, "TalkResponse"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let msg = Message::Ping(Ping {
            request_id: Bytes::from_static(&[1, 2, 3, 4]),
            enr_seq: 7,
        });
        let encoded = msg.encode_to_vec();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn nodes_round_trips_with_empty_enrs() {
        let msg = Message::Nodes(Nodes {
            request_id: Bytes::from_static(&[9]),
            total: 1,
            enrs: vec![],
        });
        let encoded = msg.encode_to_vec();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn findnode_rejects_too_many_distances() {
        let msg = Message::FindNode(FindNode {
            request_id: Bytes::from_static(&[1]),
            distances: (0..20).collect(),
        });
        let encoded = msg.encode_to_vec();
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn unknown_type_id_is_rejected() {
        let data = [0xffu8, 0xc0];
        assert!(Message::decode(&data).is_err());
    }

    #[test]
    fn request_response_classification() {
        let ping = Message::Ping(Ping {
            request_id: Bytes::new(),
            enr_seq: 0,
        });
        assert!(ping.is_request());
        assert!(!ping.is_response());
    }
}

//! # RLP (Recursive Length Prefix)
//!
//! Implementation of the RLP encoding used throughout the discv5 wire protocol:
//! packet headers, handshake auth-data and every message payload are RLP lists.
//!
//! ## Quick start
//!
//! ```
//! use discv5_rlp::encode::RLPEncode;
//! use discv5_rlp::decode::RLPDecode;
//!
//! let encoded = 42u64.encode_to_vec();
//! let decoded = u64::decode(&encoded).unwrap();
//! assert_eq!(decoded, 42);
//! ```
//!
//! ## Core traits
//!
//! - [`encode::RLPEncode`]: encode a value into a byte buffer.
//! - [`decode::RLPDecode`]: decode a value from a byte slice, returning the decoded
//!   value and the unconsumed remainder.
//!
//! ## Builder structs
//!
//! Hand-written `encode`/`decode_unfinished` implementations for structs use
//! [`structs::Encoder`] and [`structs::Decoder`] to assemble/take apart RLP lists
//! field by field, in declaration order.
//!
//! ## Supported types
//!
//! Primitives (`bool`, `u8..=u128`, `usize`), byte strings (`[u8; N]`, `Bytes`,
//! `String`), `ethereum_types` fixed-size hashes (`H256`, `H512`, ...) and `U256`,
//! `IpAddr`/`Ipv4Addr`/`Ipv6Addr`, and `Vec<T>`/tuples of `RLPEncode`/`RLPDecode`
//! types.
//!
//! ## Security
//!
//! Decoding rejects any single RLP item whose declared length exceeds a fixed
//! cap (1 GiB), and [`decode::RLPDecode::decode`] requires that the whole input
//! is consumed — trailing bytes are an error rather than silently ignored.
pub mod constants;
pub mod decode;
pub mod encode;
pub mod error;
pub mod structs;

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

//! RTM protocol data types, wire codecs and authentication primitives.
//!
//! This crate contains everything that can be described without holding a
//! socket: the [PDU envelope](types::Pdu) and its typed bodies, the
//! [JSON/CBOR frame codecs](codec), [endpoint](endpoint) normalization, and
//! the [role-secret authentication](auth) scheme. The stateful client lives
//! in `rtm-client`.

pub mod auth;
pub mod codec;
pub mod endpoint;
pub mod types;

mod error;
pub use error::{CodecError, EndpointError};

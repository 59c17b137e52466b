//! Frame codecs for the two interchangeable wire encodings.
//!
//! The encoding is chosen at construction and never changes for the life of
//! a connection: JSON PDUs travel in text frames, CBOR PDUs in binary
//! frames. A frame of the wrong flavor is a decode error, which the
//! connection treats as fatal.

use crate::{error::CodecError, types::Pdu};

/// Wire encoding negotiated at construction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CodecKind {
    /// One PDU per UTF-8 text frame, numbers as IEEE-754 doubles.
    #[default]
    Json,
    /// One PDU per binary frame, map keys are text.
    Cbor,
}

/// A framed message as produced or consumed by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    fn flavor(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }
}

impl CodecKind {
    /// Serialize one PDU into a frame of this codec's flavor.
    pub fn encode(&self, pdu: &Pdu) -> Result<Frame, CodecError> {
        match self {
            CodecKind::Json => Ok(Frame::Text(serde_json::to_string(pdu)?)),
            CodecKind::Cbor => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(pdu, &mut buf)
                    .map_err(|e| CodecError::CborEncode(e.to_string()))?;
                Ok(Frame::Binary(buf))
            }
        }
    }

    /// Parse one frame into a PDU.
    pub fn decode(&self, frame: Frame) -> Result<Pdu, CodecError> {
        match (self, frame) {
            (CodecKind::Json, Frame::Text(text)) => Ok(serde_json::from_str(&text)?),
            (CodecKind::Cbor, Frame::Binary(bytes)) => ciborium::de::from_reader(bytes.as_slice())
                .map_err(|e| CodecError::CborDecode(e.to_string())),
            (CodecKind::Json, frame) => {
                Err(CodecError::FrameMismatch { expected: "text", received: frame.flavor() })
            }
            (CodecKind::Cbor, frame) => {
                Err(CodecError::FrameMismatch { expected: "binary", received: frame.flavor() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Pdu {
        Pdu::with_id(
            "rtm/publish",
            42,
            json!({"channel": "ch", "message": {"k": 1, "xs": [1.5, "two", null, true]}}),
        )
    }

    #[test]
    fn json_round_trip() {
        let codec = CodecKind::Json;
        let frame = codec.encode(&sample()).unwrap();
        assert!(matches!(frame, Frame::Text(_)));
        assert_eq!(codec.decode(frame).unwrap(), sample());
    }

    #[test]
    fn cbor_round_trip() {
        let codec = CodecKind::Cbor;
        let frame = codec.encode(&sample()).unwrap();
        assert!(matches!(frame, Frame::Binary(_)));
        assert_eq!(codec.decode(frame).unwrap(), sample());
    }

    #[test]
    fn bodyless_pdu_round_trips_in_both_codecs() {
        let pdu = Pdu { action: "rtm/publish/ok".to_string(), id: Some(1), body: None };
        for codec in [CodecKind::Json, CodecKind::Cbor] {
            let decoded = codec.decode(codec.encode(&pdu).unwrap()).unwrap();
            assert_eq!(decoded, pdu);
        }
    }

    #[test]
    fn frame_flavor_mismatch_is_an_error() {
        let text = CodecKind::Json.encode(&sample()).unwrap();
        let binary = CodecKind::Cbor.encode(&sample()).unwrap();
        assert!(matches!(
            CodecKind::Json.decode(binary),
            Err(CodecError::FrameMismatch { expected: "text", .. })
        ));
        assert!(matches!(
            CodecKind::Cbor.decode(text),
            Err(CodecError::FrameMismatch { expected: "binary", .. })
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(CodecKind::Json.decode(Frame::Text("{not json".to_string())).is_err());
        assert!(CodecKind::Cbor.decode(Frame::Binary(vec![0xff, 0x00, 0x13])).is_err());
    }
}

//! Frame types exchanged with clients and the signed-byte codec.
//!
//! Frames are JSON objects. Inbound frames carry a `Varient` tag (the
//! historical spelling used by existing clients) and an opaque `Data`
//! payload that is parsed per variant. Outbound frames carry a lowercase
//! `variant` tag and a `body`.
//!
//! Binary payloads (ciphertext, DER key bytes) travel as JSON arrays of
//! *signed* 8-bit integers: existing clients encode bytes above 127 as
//! negative values. [to_signed_bytes] and [from_signed_bytes] perform the
//! two's-complement conversion at the egress and ingress edges.

/// A single inbound frame read from a client connection.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Message {
    #[serde(rename = "Varient", alias = "variant")]
    pub variant: String,
    #[serde(rename = "Data", alias = "data", default)]
    pub data: serde_json::Value,
}

/// A single outbound frame written to a client connection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutgoingMessage {
    pub variant: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub body: serde_json::Value,
}

impl OutgoingMessage {
    pub fn new(variant: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            variant: variant.into(),
            body,
        }
    }

    /// A frame that consists of its variant tag only.
    pub fn bare(variant: impl Into<String>) -> Self {
        Self::new(variant, serde_json::Value::Null)
    }
}

/// Tagged payload routed through the exchange.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Data {
    #[serde(alias = "Varient", alias = "Variant")]
    pub variant: String,
    #[serde(alias = "Content", default)]
    pub content: serde_json::Value,
}

/// Routing envelope sent by a client: deliver `data` to the mailbox `to`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToMessage {
    #[serde(alias = "To")]
    pub to: String,
    #[serde(alias = "Data")]
    pub data: Data,
}

/// Routing envelope delivered to a mailbox subscriber: `data` sent by `from`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FromMessage {
    #[serde(alias = "From")]
    pub from: String,
    #[serde(alias = "Data")]
    pub data: Data,
}

impl FromMessage {
    /// An error notification delivered on behalf of the exchange itself.
    pub fn system_error(content: impl Into<String>) -> Self {
        Self {
            from: "System".to_string(),
            data: Data {
                variant: "Error".to_string(),
                content: serde_json::Value::String(content.into()),
            },
        }
    }
}

/// `SetPublicKey` payload: the client public key as a PEM string.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PublicKeyBody {
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// `Verify` payload: ciphertext as a signed-byte array.
///
/// Values are read as 16-bit integers and truncated to the low byte so that
/// clients sending unsigned bytes (0…255) keep working.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VerifyBody {
    pub message: Vec<i16>,
}

pub fn to_signed_bytes(bytes: &[u8]) -> Vec<i8> {
    bytes.iter().map(|byte| *byte as i8).collect()
}

pub fn from_signed_bytes(values: &[i16]) -> Vec<u8> {
    values.iter().map(|value| *value as u8).collect()
}

/// Extract ciphertext bytes from an inbound payload.
///
/// Clients send ciphertext either as a bare signed-byte array or wrapped as
/// `{"message": [...]}`; both shapes are accepted.
pub fn decode_cipher_payload(data: &serde_json::Value) -> Option<Vec<u8>> {
    if let Ok(values) = serde_json::from_value::<Vec<i16>>(data.clone()) {
        return Some(from_signed_bytes(&values));
    }
    serde_json::from_value::<VerifyBody>(data.clone())
        .ok()
        .map(|body| from_signed_bytes(&body.message))
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn signed_bytes_egress() {
        assert_eq!(
            to_signed_bytes(&[0, 1, 127, 128, 255]),
            vec![0, 1, 127, -128, -1]
        );
    }

    #[test]
    fn signed_bytes_ingress_tolerates_both_encodings() {
        assert_eq!(
            from_signed_bytes(&[-128, -1, 128, 255, 7]),
            vec![128, 255, 128, 255, 7]
        );
    }

    #[test_strategy::proptest]
    fn signed_bytes_roundtrip(data: Vec<u8>) {
        let signed = to_signed_bytes(&data);
        let widened = signed.iter().map(|value| i16::from(*value)).collect::<Vec<_>>();
        prop_assert_eq!(from_signed_bytes(&widened), data);
    }

    #[test]
    fn parses_inbound_message() {
        let message =
            serde_json::from_str::<Message>(r#"{"Varient": "GetPublicKey"}"#).unwrap();
        assert_eq!(message.variant, "GetPublicKey");
        assert_eq!(message.data, serde_json::Value::Null);

        let message =
            serde_json::from_str::<Message>(r#"{"variant": "Verify", "data": {"message": [1]}}"#)
                .unwrap();
        assert_eq!(message.variant, "Verify");
        assert_eq!(message.data, serde_json::json!({ "message": [1] }));
    }

    #[test]
    fn serializes_outgoing_message() {
        let frame = serde_json::to_value(OutgoingMessage::bare("Ready")).unwrap();
        assert_eq!(frame, serde_json::json!({ "variant": "Ready" }));

        let frame = serde_json::to_value(OutgoingMessage::new(
            "AvailableActions",
            serde_json::json!(["connect", "reconnect"]),
        ))
        .unwrap();
        assert_eq!(
            frame,
            serde_json::json!({ "variant": "AvailableActions", "body": ["connect", "reconnect"] })
        );
    }

    #[test]
    fn data_accepts_historical_field_spellings() {
        let data = serde_json::from_str::<Data>(r#"{"Varient": "T", "Content": "x"}"#).unwrap();
        assert_eq!(
            data,
            Data {
                variant: "T".to_string(),
                content: serde_json::json!("x"),
            }
        );
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            serde_json::json!({ "variant": "T", "content": "x" })
        );
    }

    #[test]
    fn from_message_system_error_shape() {
        let message = FromMessage::system_error("Destination does not exist [99]");
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            serde_json::json!({
                "from": "System",
                "data": {
                    "variant": "Error",
                    "content": "Destination does not exist [99]",
                },
            })
        );
    }

    #[test]
    fn decodes_cipher_payloads() {
        let bare = serde_json::json!([1, -1, 200]);
        assert_eq!(decode_cipher_payload(&bare), Some(vec![1, 255, 200]));

        let wrapped = serde_json::json!({ "message": [1, -1, 200] });
        assert_eq!(decode_cipher_payload(&wrapped), Some(vec![1, 255, 200]));

        assert_eq!(decode_cipher_payload(&serde_json::json!("nope")), None);
    }
}

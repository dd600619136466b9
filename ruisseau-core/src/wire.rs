//! Encoding: one JSON object per bus message; chunk payloads are base64 inside `songData`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::protocol::Message;

const MAX_MESSAGE_LEN: usize = 1024 * 1024; // 1 MiB

/// Encode a message as UTF-8 JSON.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let out = serde_json::to_vec(msg)?;
    if out.len() > MAX_MESSAGE_LEN {
        return Err(EncodeError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Error encoding a message (serializer or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message too large ({0} bytes)")]
    TooLarge(usize),
}

/// Decode one bus payload into a message.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Malformed inbound data: bad JSON, oversize message, or bad chunk payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message too large ({0} bytes)")]
    TooLarge(usize),
    #[error("decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("chunk payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
}

pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_payload(data: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(BASE64.decode(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Action, Song, WireDialect};

    #[test]
    fn chunk_message_roundtrip() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let msg = Message::media_chunk("alice", "bob", "ABCD", 4096, &payload, WireDialect::Legacy);
        let bytes = encode(&msg).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        let data = decoded.song_data.as_deref().unwrap();
        assert_eq!(decode_payload(data).unwrap(), payload);
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let bytes = encode(&Message::online("alice")).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"action":"online","sender":"alice","recipient":"*"}"#);
    }

    #[test]
    fn song_uses_camel_case_fields() {
        let song = Song {
            title: "T".into(),
            artist: "A".into(),
            year: 1999,
            duration_seconds: 215,
            size_bytes: 9000,
            featuring: vec!["F".into()],
            hash: "H".into(),
        };
        let value = serde_json::to_value(&song).unwrap();
        assert_eq!(value["durationSeconds"], 215);
        assert_eq!(value["sizeBytes"], 9000);
        assert_eq!(value["featuring"][0], "F");
    }

    #[test]
    fn accepts_pascal_case_and_nulls() {
        let raw = br#"{
            "Action": "sendCatalog",
            "Sender": "User_123",
            "Recipient": "*",
            "SongList": [{"Title": "Song", "Artist": "Band", "Year": 2001, "Size": 42,
                          "Featuring": [], "Hash": "AA", "Duration": "00:03:00"}],
            "Hash": null, "StartByte": null, "EndByte": null, "SongData": null
        }"#;
        let msg = decode(raw).unwrap();
        assert_eq!(msg.action, Action::SendCatalog);
        assert_eq!(msg.sender, "User_123");
        assert!(msg.hash.is_none());
        let songs = msg.song_list.unwrap();
        assert_eq!(songs[0].title, "Song");
        assert_eq!(songs[0].size_bytes, 42);
        assert_eq!(songs[0].duration_seconds, 180);
    }

    #[test]
    fn unknown_action_still_decodes() {
        let msg = decode(br#"{"action":"wave","sender":"x","recipient":"*"}"#).unwrap();
        assert_eq!(msg.action, Action::Unknown("wave".into()));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decode(br#"{"recipient":"*"}"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode(br#"{"action":"online","sender":"x","startByte":-5}"#),
            Err(DecodeError::Json(_))
        ));
        let big = vec![b' '; MAX_MESSAGE_LEN + 1];
        assert!(matches!(decode(&big), Err(DecodeError::TooLarge(_))));
        assert!(matches!(
            decode_payload("@@not base64@@"),
            Err(DecodeError::Payload(_))
        ));
    }
}

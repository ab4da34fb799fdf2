use serde::{Deserialize, Serialize};

use super::{PeerId, Timestamp};
use crate::{Error, Result};

/// Protocol message exchanged between peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Message {
    Request { sender_id: PeerId, time: Timestamp },
    Reply { sender_id: PeerId, time: Timestamp },
}

// Flat wire form: {"type": "REQUEST" | "REPLY", "sender_id": .., "time": ..}
#[derive(Serialize, Deserialize)]
struct Wire<'a> {
    #[serde(rename = "type", borrow)]
    kind: std::borrow::Cow<'a, str>,
    sender_id: PeerId,
    time: Timestamp,
}

impl Message {
    const REQUEST: &'static str = "REQUEST";
    const REPLY: &'static str = "REPLY";

    pub fn sender_id(&self) -> PeerId {
        match self {
            Message::Request { sender_id, .. } | Message::Reply { sender_id, .. } => *sender_id,
        }
    }

    pub fn time(&self) -> Timestamp {
        match self {
            Message::Request { time, .. } | Message::Reply { time, .. } => *time,
        }
    }

    pub fn serialize(&self) -> Result<String> {
        let kind = match self {
            Message::Request { .. } => Self::REQUEST,
            Message::Reply { .. } => Self::REPLY,
        };
        Ok(serde_json::to_string(&Wire {
            kind: kind.into(),
            sender_id: self.sender_id(),
            time: self.time(),
        })?)
    }

    pub fn deserialize(s: &str) -> Result<Self> {
        let Wire {
            kind,
            sender_id,
            time,
        } = serde_json::from_str(s)?;
        match kind.as_ref() {
            Self::REQUEST => Ok(Message::Request { sender_id, time }),
            Self::REPLY => Ok(Message::Reply { sender_id, time }),
            _ => Err(Error::UnknownMessageType(kind.into_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::order::{Message, PeerId};
    use crate::Error;
    use rand::Rng;

    #[test]
    fn wire_format() {
        let m = Message::Request {
            sender_id: PeerId(2),
            time: 7,
        };
        let v: serde_json::Value = serde_json::from_str(&m.serialize().unwrap()).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"type": "REQUEST", "sender_id": 2, "time": 7})
        );

        let m = Message::deserialize(r#"{"type":"REPLY","sender_id":0,"time":3}"#).unwrap();
        assert_eq!(
            m,
            Message::Reply {
                sender_id: PeerId(0),
                time: 3
            }
        );
    }

    #[test]
    fn round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let sender_id = PeerId(rng.gen());
            let time = rng.gen();
            for m in [
                Message::Request { sender_id, time },
                Message::Reply { sender_id, time },
            ] {
                assert_eq!(Message::deserialize(&m.serialize().unwrap()).unwrap(), m);
            }
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let err = Message::deserialize(r#"{"type":"RELEASE","sender_id":0,"time":3}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType(t) if t == "RELEASE"));

        let err = Message::deserialize(r#"{"type":"REQUEST","sender_id":0}"#).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}

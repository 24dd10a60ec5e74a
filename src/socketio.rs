//! Text-frame codec for the Engine.IO v3 / Socket.IO v2 wire format used by
//! the live-data channel.
//!
//! Every WebSocket text frame is one Engine.IO packet: a single type digit
//! followed by its data. Engine.IO `message` packets carry one Socket.IO packet:
//!
//! ```text
//! <type>[/<namespace>,][<ack id>][<json>]
//! 42/api/circuit-data,["data",{"circuits":[...]}]
//! ```
//!
//! Binary attachments are not used by the vendor and are rejected.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Engine.IO protocol revision requested in the handshake URL.
pub const ENGINE_IO_VERSION: &str = "3";

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unknown packet type '{0}'")]
    UnknownType(char),
    #[error("unsupported packet type '{0}'")]
    Unsupported(char),
    #[error("invalid JSON in packet: {0}")]
    InvalidJson(String),
    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Parameters the server announces in the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    /// Milliseconds between client pings.
    pub ping_interval: u64,
    /// Milliseconds to wait for a pong before the connection is dead.
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let data = chars.as_str();

        match kind {
            '0' => serde_json::from_str(data)
                .map(Self::Open)
                .map_err(|e| CodecError::InvalidJson(e.to_string())),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(data.to_string())),
            '3' => Ok(Self::Pong(data.to_string())),
            '4' => Ok(Self::Message(data.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(CodecError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            // Only the server opens a session; re-encoding is for completeness.
            Self::Open(handshake) => format!(
                "0{{\"sid\":\"{}\",\"pingInterval\":{},\"pingTimeout\":{}}}",
                handshake.sid, handshake.ping_interval, handshake.ping_timeout
            ),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Namespace join. `query` is only sent by the client.
    Connect {
        namespace: String,
        query: Option<String>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        id: u64,
        args: Vec<Value>,
    },
    Error {
        namespace: String,
        data: Value,
    },
}

impl SocketPacket {
    pub fn event(namespace: &str, name: &str, args: Vec<Value>) -> Self {
        Self::Event {
            namespace: namespace.to_string(),
            name: name.to_string(),
            args,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::Connect { namespace, .. }
            | Self::Disconnect { namespace }
            | Self::Event { namespace, .. }
            | Self::Ack { namespace, .. }
            | Self::Error { namespace, .. } => namespace,
        }
    }

    /// Decode the body of an Engine.IO `message` packet.
    pub fn decode(body: &str) -> Result<Self, CodecError> {
        let mut chars = body.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(CodecError::Unsupported(kind));
        }
        if !matches!(kind, '0'..='4') {
            return Err(CodecError::UnknownType(kind));
        }

        let (namespace, rest) = split_namespace(rest);
        let id_len = rest.chars().take_while(char::is_ascii_digit).count();
        let (id, payload) = rest.split_at(id_len);
        let id = if id.is_empty() {
            None
        } else {
            Some(
                id.parse::<u64>()
                    .map_err(|e| CodecError::Malformed(format!("ack id: {e}")))?,
            )
        };

        let json = if payload.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<Value>(payload)
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?,
            )
        };

        match kind {
            '0' => Ok(Self::Connect {
                namespace,
                query: None,
            }),
            '1' => Ok(Self::Disconnect { namespace }),
            '2' => {
                let mut items = match json {
                    Some(Value::Array(items)) if !items.is_empty() => items,
                    _ => return Err(CodecError::Malformed("event without a name".to_string())),
                };
                let name = match items.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(CodecError::Malformed(format!("event name is not a string: {other}")))
                    }
                };
                Ok(Self::Event {
                    namespace,
                    name,
                    args: items,
                })
            }
            '3' => {
                let id = id.ok_or_else(|| CodecError::Malformed("ack without an id".to_string()))?;
                let args = match json {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                Ok(Self::Ack {
                    namespace,
                    id,
                    args,
                })
            }
            _ => Ok(Self::Error {
                namespace,
                data: json.unwrap_or(Value::Null),
            }),
        }
    }

    /// Encode as an Engine.IO `message` body (without the leading `4`).
    pub fn encode(&self) -> String {
        match self {
            Self::Connect { namespace, query } => {
                let query = query.as_deref().map(|q| format!("?{q}")).unwrap_or_default();
                if is_root(namespace) {
                    "0".to_string()
                } else {
                    format!("0{namespace}{query},")
                }
            }
            Self::Disconnect { namespace } => format!("1{}", namespace_prefix(namespace)),
            Self::Event {
                namespace,
                name,
                args,
            } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                format!("2{}{}", namespace_prefix(namespace), Value::Array(items))
            }
            Self::Ack {
                namespace,
                id,
                args,
            } => format!(
                "3{}{}{}",
                namespace_prefix(namespace),
                id,
                Value::Array(args.clone())
            ),
            Self::Error { namespace, data } => format!("4{}{}", namespace_prefix(namespace), data),
        }
    }

    /// Full WebSocket frame text for this packet.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

fn is_root(namespace: &str) -> bool {
    namespace.is_empty() || namespace == "/"
}

fn namespace_prefix(namespace: &str) -> String {
    if is_root(namespace) {
        String::new()
    } else {
        format!("{namespace},")
    }
}

/// Split `/ns?query,rest` into (`/ns`, `rest`). Root packets have no prefix.
fn split_namespace(input: &str) -> (String, &str) {
    if !input.starts_with('/') {
        return ("/".to_string(), input);
    }
    let (head, rest) = match input.find(',') {
        Some(comma) => (&input[..comma], &input[comma + 1..]),
        None => (input, ""),
    };
    let namespace = head.split('?').next().unwrap_or(head);
    (namespace.to_string(), rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NS: &str = "/api/circuit-data";

    #[test]
    fn decodes_open_handshake() {
        let packet =
            EnginePacket::decode(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#)
                .unwrap();
        assert_eq!(
            packet,
            EnginePacket::Open(Handshake {
                sid: "abc".into(),
                ping_interval: 25_000,
                ping_timeout: 5_000,
            })
        );
    }

    #[test]
    fn decodes_engine_control_packets() {
        assert_eq!(EnginePacket::decode("1").unwrap(), EnginePacket::Close);
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping(String::new()));
        assert_eq!(EnginePacket::decode("3probe").unwrap(), EnginePacket::Pong("probe".into()));
        assert_eq!(EnginePacket::decode("6").unwrap(), EnginePacket::Noop);
        assert_eq!(EnginePacket::decode(""), Err(CodecError::Empty));
        assert_eq!(EnginePacket::decode("9"), Err(CodecError::UnknownType('9')));
    }

    #[test]
    fn decodes_namespaced_event() {
        let packet = SocketPacket::decode(
            r#"2/api/circuit-data,["data",{"circuits":[{"id":"c1","w":10}]}]"#,
        )
        .unwrap();
        assert_eq!(
            packet,
            SocketPacket::Event {
                namespace: NS.into(),
                name: "data".into(),
                args: vec![json!({"circuits":[{"id":"c1","w":10}]})],
            }
        );
    }

    #[test]
    fn decodes_root_and_namespace_connect() {
        assert_eq!(
            SocketPacket::decode("0").unwrap(),
            SocketPacket::Connect {
                namespace: "/".into(),
                query: None
            }
        );
        let packet = SocketPacket::decode("0/api/circuit-data,").unwrap();
        assert_eq!(packet.namespace(), NS);
    }

    #[test]
    fn decodes_event_without_args_and_with_ack_id() {
        let packet = SocketPacket::decode(r#"2/api/circuit-data,7["authorized"]"#).unwrap();
        assert_eq!(packet, SocketPacket::event(NS, "authorized", vec![]));
    }

    #[test]
    fn decodes_disconnect_and_error() {
        assert_eq!(
            SocketPacket::decode("1/api/circuit-data,").unwrap(),
            SocketPacket::Disconnect {
                namespace: NS.into()
            }
        );
        assert_eq!(
            SocketPacket::decode(r#"4/api/circuit-data,"Invalid namespace""#).unwrap(),
            SocketPacket::Error {
                namespace: NS.into(),
                data: json!("Invalid namespace"),
            }
        );
    }

    #[test]
    fn rejects_malformed_packets() {
        assert!(matches!(
            SocketPacket::decode("2/api/circuit-data,{\"x\":1}"),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            SocketPacket::decode("2[not json"),
            Err(CodecError::InvalidJson(_))
        ));
        assert_eq!(
            SocketPacket::decode("5-/ns,[]"),
            Err(CodecError::Unsupported('5'))
        );
    }

    #[test]
    fn encodes_client_frames() {
        let connect = SocketPacket::Connect {
            namespace: NS.into(),
            query: Some("token=t0k".into()),
        };
        assert_eq!(connect.to_frame(), "40/api/circuit-data?token=t0k,");

        let auth = SocketPacket::event(NS, "authenticate", vec![json!({"token": "t0k"})]);
        assert_eq!(
            auth.to_frame(),
            r#"42/api/circuit-data,["authenticate",{"token":"t0k"}]"#
        );

        let root = SocketPacket::event("/", "subscribe", vec![json!("loc-1")]);
        assert_eq!(root.to_frame(), r#"42["subscribe","loc-1"]"#);
    }

    #[test]
    fn encoded_events_decode_to_the_same_packet() {
        let packet = SocketPacket::event(NS, "subscribe", vec![json!("loc-1")]);
        assert_eq!(SocketPacket::decode(&packet.encode()).unwrap(), packet);
    }
}

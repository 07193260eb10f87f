//! Tarantool binary protocol (IPROTO) framing.
//!
//! Every packet is `<MP_UINT length><header map><body map>`. Requests carry a
//! `sync` id in the header which the server echoes back, so responses on one
//! socket can be matched to requests regardless of arrival order.

use base64::Engine;
use rmpv::Value;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::IprotoError;

/// The server sends exactly this many bytes before any packet.
pub const GREETING_LEN: usize = 128;

/// Upper bound on a single packet; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Response codes with this bit set carry an error.
pub const ERROR_FLAG: u64 = 0x8000;

/// Header and body map keys.
pub mod key {
    pub const REQUEST_TYPE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const TUPLE: u64 = 0x21;
    pub const FUNCTION_NAME: u64 = 0x22;
    pub const USER_NAME: u64 = 0x23;
    pub const DATA: u64 = 0x30;
    pub const ERROR_24: u64 = 0x31;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestType {
    Auth,
    Call,
    Ping,
}

impl RequestType {
    pub fn code(self) -> u64 {
        match self {
            RequestType::Auth => 0x07,
            RequestType::Call => 0x0a,
            RequestType::Ping => 0x40,
        }
    }
}

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub version: String,
    pub salt: Vec<u8>,
}

impl Greeting {
    /// Two 64-byte lines: a version banner, then a base64 salt padded with spaces.
    pub fn parse(raw: &[u8]) -> Result<Self, IprotoError> {
        if raw.len() != GREETING_LEN {
            return Err(IprotoError::protocol(format!(
                "greeting must be {} bytes, got {}",
                GREETING_LEN,
                raw.len()
            )));
        }

        let banner = String::from_utf8_lossy(&raw[..64]);
        if !banner.starts_with("Tarantool") {
            return Err(IprotoError::protocol(format!(
                "unexpected greeting banner {:?}",
                banner.trim_end()
            )));
        }

        let salt_line = std::str::from_utf8(&raw[64..])
            .map_err(|e| IprotoError::protocol(format!("greeting salt is not UTF-8: {}", e)))?;
        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt_line.trim())
            .map_err(|e| IprotoError::protocol(format!("greeting salt is not base64: {}", e)))?;
        if salt.len() < 20 {
            return Err(IprotoError::protocol("greeting salt is too short"));
        }

        Ok(Self {
            version: banner.trim_end().to_string(),
            salt,
        })
    }
}

/// `chap-sha1` scramble:
/// `sha1(password) XOR sha1(salt[..20] ++ sha1(sha1(password)))`.
pub fn scramble(password: &str, salt: &[u8]) -> [u8; 20] {
    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..20.min(salt.len())]);
    hasher.update(step2);
    let step3 = hasher.finalize();

    let mut out = [0u8; 20];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    out
}

pub fn auth_body(user: &str, password: &str, salt: &[u8]) -> Vec<(Value, Value)> {
    let scrambled = scramble(password, salt);
    vec![
        (Value::from(key::USER_NAME), Value::from(user)),
        (
            Value::from(key::TUPLE),
            Value::Array(vec![
                Value::from("chap-sha1"),
                Value::Binary(scrambled.to_vec()),
            ]),
        ),
    ]
}

pub fn call_body(function: &str, args: Vec<Value>) -> Vec<(Value, Value)> {
    vec![
        (Value::from(key::FUNCTION_NAME), Value::from(function)),
        (Value::from(key::TUPLE), Value::Array(args)),
    ]
}

/// Encode a complete request packet, length prefix included.
pub fn encode_request(
    request_type: RequestType,
    sync: u64,
    body: Vec<(Value, Value)>,
) -> Result<Vec<u8>, IprotoError> {
    let header = Value::Map(vec![
        (Value::from(key::REQUEST_TYPE), Value::from(request_type.code())),
        (Value::from(key::SYNC), Value::from(sync)),
    ]);
    encode_packet(&header, &Value::Map(body))
}

pub(crate) fn encode_packet(header: &Value, body: &Value) -> Result<Vec<u8>, IprotoError> {
    let mut payload = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut payload, header)
        .map_err(|e| IprotoError::Encode(e.to_string()))?;
    rmpv::encode::write_value(&mut payload, body)
        .map_err(|e| IprotoError::Encode(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| IprotoError::Encode("packet too large".to_string()))?;

    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(0xce);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read one packet body (header + body bytes, without the length prefix).
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, IprotoError>
where
    R: AsyncRead + Unpin,
{
    let marker = reader.read_u8().await?;
    let len = match marker {
        0x00..=0x7f => u64::from(marker),
        0xcc => u64::from(reader.read_u8().await?),
        0xcd => u64::from(reader.read_u16().await?),
        0xce => u64::from(reader.read_u32().await?),
        0xcf => reader.read_u64().await?,
        other => {
            return Err(IprotoError::protocol(format!(
                "invalid packet length marker 0x{:02x}",
                other
            )));
        }
    };

    if len > MAX_FRAME_LEN {
        return Err(IprotoError::protocol(format!(
            "packet of {} bytes exceeds limit",
            len
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Look up an integer key in a MessagePack map.
pub fn map_get(map: &Value, wanted: u64) -> Option<&Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_u64() == Some(wanted))
        .map(|(_, v)| v)
}

/// A decoded response packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub sync: u64,
    pub code: u64,
    pub body: Value,
}

impl Response {
    pub fn decode(frame: &[u8]) -> Result<Self, IprotoError> {
        let mut cursor = frame;
        let header = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| IprotoError::protocol(format!("bad response header: {}", e)))?;

        let code = map_get(&header, key::REQUEST_TYPE)
            .and_then(Value::as_u64)
            .ok_or_else(|| IprotoError::protocol("response header has no code"))?;
        let sync = map_get(&header, key::SYNC)
            .and_then(Value::as_u64)
            .ok_or_else(|| IprotoError::protocol("response header has no sync"))?;

        // Some responses (e.g. to PING) have no body at all.
        let body = if cursor.is_empty() {
            Value::Map(Vec::new())
        } else {
            rmpv::decode::read_value(&mut cursor)
                .map_err(|e| IprotoError::protocol(format!("bad response body: {}", e)))?
        };

        Ok(Self { sync, code, body })
    }

    pub fn is_error(&self) -> bool {
        self.code & ERROR_FLAG != 0
    }

    /// The `IPROTO_DATA` payload, or the server error this response carries.
    pub fn into_data(self) -> Result<Value, IprotoError> {
        if self.is_error() {
            let message = map_get(&self.body, key::ERROR_24)
                .and_then(Value::as_str)
                .unwrap_or("unknown server error")
                .to_string();
            return Err(IprotoError::Server {
                code: self.code & !ERROR_FLAG,
                message,
            });
        }

        Ok(map_get(&self.body, key::DATA)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting(banner: &str, salt_b64: &str) -> Vec<u8> {
        let mut raw = Vec::with_capacity(GREETING_LEN);
        raw.extend_from_slice(format!("{:<63}\n", banner).as_bytes());
        raw.extend_from_slice(format!("{:<63}\n", salt_b64).as_bytes());
        raw
    }

    #[test]
    fn parses_greeting() {
        let raw = greeting(
            "Tarantool 2.11.1 (Binary) 7c1d3a4e-0000-0000-0000-000000000000",
            "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=",
        );

        let greeting = Greeting::parse(&raw).unwrap();

        assert!(greeting.version.starts_with("Tarantool 2.11.1"));
        assert_eq!(greeting.salt, (0u8..32).collect::<Vec<_>>());
    }

    #[test]
    fn rejects_foreign_banner() {
        let raw = greeting("SSH-2.0-OpenSSH_9.0", "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=");
        assert!(matches!(
            Greeting::parse(&raw),
            Err(IprotoError::Protocol(_))
        ));
    }

    #[test]
    fn scramble_matches_reference_vector() {
        let salt: Vec<u8> = (0u8..32).collect();
        let expected = [
            0x21, 0xb3, 0xff, 0x40, 0x5f, 0x32, 0xcb, 0xe4, 0xaa, 0xff, 0xf2, 0x91, 0x39, 0x60,
            0x46, 0xea, 0x29, 0xfa, 0x3a, 0x4d,
        ];
        assert_eq!(scramble("secret", &salt), expected);
    }

    #[tokio::test]
    async fn request_frame_is_length_prefixed() {
        let frame = encode_request(
            RequestType::Call,
            7,
            call_body("queue.tube.deals:take", vec![Value::F64(0.5)]),
        )
        .unwrap();

        assert_eq!(frame[0], 0xce);
        let declared = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(declared, frame.len() - 5);

        let mut reader = &frame[..];
        let payload = read_frame(&mut reader).await.unwrap();
        let mut cursor = &payload[..];
        let header = rmpv::decode::read_value(&mut cursor).unwrap();
        let body = rmpv::decode::read_value(&mut cursor).unwrap();

        assert_eq!(map_get(&header, key::REQUEST_TYPE).and_then(Value::as_u64), Some(0x0a));
        assert_eq!(map_get(&header, key::SYNC).and_then(Value::as_u64), Some(7));
        assert_eq!(
            map_get(&body, key::FUNCTION_NAME).and_then(Value::as_str),
            Some("queue.tube.deals:take")
        );
    }

    #[tokio::test]
    async fn rejects_bad_length_marker() {
        let mut reader: &[u8] = &[0xc0, 0x00];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(IprotoError::Protocol(_))
        ));
    }

    #[test]
    fn decodes_error_response() {
        let header = Value::Map(vec![
            (Value::from(key::REQUEST_TYPE), Value::from(ERROR_FLAG | 33)),
            (Value::from(key::SYNC), Value::from(3u64)),
        ]);
        let body = Value::Map(vec![(
            Value::from(key::ERROR_24),
            Value::from("Procedure 'nope' is not defined"),
        )]);
        let frame = encode_packet(&header, &body).unwrap();

        let response = Response::decode(&frame[5..]).unwrap();
        assert_eq!(response.sync, 3);
        assert!(response.is_error());

        match response.into_data() {
            Err(IprotoError::Server { code, message }) => {
                assert_eq!(code, 33);
                assert!(message.contains("not defined"));
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn bodiless_response_yields_empty_data() {
        let header = Value::Map(vec![
            (Value::from(key::REQUEST_TYPE), Value::from(0u64)),
            (Value::from(key::SYNC), Value::from(1u64)),
        ]);
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &header).unwrap();

        let response = Response::decode(&payload).unwrap();
        assert_eq!(response.into_data().unwrap(), Value::Array(vec![]));
    }
}

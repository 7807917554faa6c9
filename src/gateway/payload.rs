//! Gateway wire protocol: payload envelope, opcodes, close-code policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Receive: an event was dispatched.
    Dispatch = 0,
    /// Send/receive: keep the connection alive.
    Heartbeat = 1,
    /// Send: start a new session.
    Identify = 2,
    /// Send: update presence.
    PresenceUpdate = 3,
    /// Send: join, leave or move between voice channels.
    VoiceStateUpdate = 4,
    /// Send: resume a dropped session.
    Resume = 6,
    /// Receive: the server wants us to reconnect.
    Reconnect = 7,
    /// Send: request guild members.
    RequestGuildMembers = 8,
    /// Receive: session invalidated.
    InvalidSession = 9,
    /// Receive: first payload after connecting.
    Hello = 10,
    /// Receive: heartbeat acknowledged.
    HeartbeatAck = 11,
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Dispatch),
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::Identify),
            3 => Ok(Self::PresenceUpdate),
            4 => Ok(Self::VoiceStateUpdate),
            6 => Ok(Self::Resume),
            7 => Ok(Self::Reconnect),
            8 => Ok(Self::RequestGuildMembers),
            9 => Ok(Self::InvalidSession),
            10 => Ok(Self::Hello),
            11 => Ok(Self::HeartbeatAck),
            _ => Err(()),
        }
    }
}

/// The `{op, d, s, t}` envelope. `s` and `t` only appear on DISPATCH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// A send-direction payload: opcode and data only.
    #[must_use]
    pub fn command(op: Opcode, d: Value) -> Self {
        Self {
            op: op as u8,
            d: Some(d),
            s: None,
            t: None,
        }
    }
}

/// IDENTIFY data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub intents: u64,
    pub properties: IdentifyProperties,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

/// Connection properties sent with IDENTIFY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.into(),
            browser: "lanyard".into(),
            device: "lanyard".into(),
        }
    }
}

/// RESUME data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Close codes that must never be retried: bad token, bad shard, bad
/// version, bad intents.
const FATAL_CLOSE_CODES: [u16; 6] = [4004, 4010, 4011, 4012, 4013, 4014];

/// Close codes after which the session itself is gone and the client must
/// re-IDENTIFY instead of resuming.
const SESSION_ENDING_CLOSE_CODES: [u16; 2] = [4007, 4009];

#[must_use]
pub fn is_fatal_close(code: u16) -> bool {
    FATAL_CLOSE_CODES.contains(&code)
}

/// Whether a session may be resumed after closing with `code`.
#[must_use]
pub fn can_resume_after(code: Option<u16>) -> bool {
    match code {
        Some(code) => !is_fatal_close(code) && !SESSION_ENDING_CLOSE_CODES.contains(&code),
        // 1006-style abnormal closure without a frame: resume.
        None => true,
    }
}

#[must_use]
pub fn close_code_description(code: u16) -> &'static str {
    match code {
        4000 => "unknown error",
        4001 => "unknown opcode",
        4002 => "decode error",
        4003 => "not authenticated",
        4004 => "authentication failed",
        4005 => "already authenticated",
        4007 => "invalid sequence",
        4008 => "rate limited",
        4009 => "session timed out",
        4010 => "invalid shard",
        4011 => "sharding required",
        4012 => "invalid API version",
        4013 => "invalid intents",
        4014 => "disallowed intents",
        _ => "unknown close code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_round_trip_is_identity() {
        let original = GatewayPayload {
            op: 0,
            d: Some(json!({"content": "hi", "id": "42"})),
            s: Some(17),
            t: Some("MESSAGE_CREATE".into()),
        };
        let text = serde_json::to_string(&original).unwrap();
        let back: GatewayPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(back.op, original.op);
        assert_eq!(back.d, original.d);
        assert_eq!(back.s, original.s);
        assert_eq!(back.t, original.t);
    }

    #[test]
    fn non_dispatch_payloads_omit_s_and_t() {
        let heartbeat = GatewayPayload::command(Opcode::Heartbeat, json!(42));
        let text = serde_json::to_string(&heartbeat).unwrap();
        assert!(!text.contains("\"s\""));
        assert!(!text.contains("\"t\""));
        assert!(text.contains("\"op\":1"));
    }

    #[test]
    fn opcode_conversion_is_exhaustive_over_known_values() {
        for code in [0_u8, 1, 2, 3, 4, 6, 7, 8, 9, 10, 11] {
            let op = Opcode::try_from(code).unwrap();
            assert_eq!(op as u8, code);
        }
        assert!(Opcode::try_from(5).is_err());
        assert!(Opcode::try_from(12).is_err());
    }

    #[test]
    fn fatal_codes_do_not_reconnect() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert!(is_fatal_close(code));
            assert!(!can_resume_after(Some(code)));
        }
        assert!(!is_fatal_close(4000));
        assert!(can_resume_after(Some(4000)));
        assert!(can_resume_after(None));
    }

    #[test]
    fn stale_sessions_reidentify() {
        assert!(!can_resume_after(Some(4007)));
        assert!(!can_resume_after(Some(4009)));
        assert!(!is_fatal_close(4009));
    }

    #[test]
    fn identify_wire_shape() {
        let identify = Identify {
            token: "T".into(),
            intents: 513,
            properties: IdentifyProperties::default(),
            compress: None,
            large_threshold: Some(250),
            shard: Some([0, 1]),
            presence: None,
        };
        let value = serde_json::to_value(&identify).unwrap();
        assert_eq!(value["intents"], 513);
        assert_eq!(value["shard"], json!([0, 1]));
        assert!(value.get("compress").is_none());
        assert!(value.get("presence").is_none());
    }
}

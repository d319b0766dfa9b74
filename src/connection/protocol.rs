//! Voice bridge protocol types
//!
//! The bridge is a sidecar that holds the actual voice gateway connection.
//! We talk to it over one WebSocket per session: JSON text frames for control,
//! binary frames for audio.
//!
//! # Protocol Overview
//!
//! 1. Connect to the bridge URL
//! 2. Send `join` with the guild and channel
//! 3. Receive `state` updates as the voice connection progresses
//! 4. Send `play` with the audio format, then stream binary audio frames
//! 5. Send `leave` and close

use serde::{Deserialize, Serialize};

use super::ConnectivityState;
use crate::stream::AudioFormat;

// ============================================================================
// Client Messages (sent TO the bridge)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        guild_id: String,
        channel_id: String,
        self_deaf: bool,
    },
    /// Audio frames that follow are in `format`
    Play { format: AudioFormat },
    Stop,
    Leave,
}

// ============================================================================
// Server Messages (received FROM the bridge)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    State { state: ConnectivityState },
    Error { message: String },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_serializes_flat() {
        let msg = ClientMessage::Join {
            guild_id: "10".to_string(),
            channel_id: "20".to_string(),
            self_deaf: true,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "join");
        assert_eq!(json["guild_id"], "10");
        assert_eq!(json["channel_id"], "20");
        assert_eq!(json["self_deaf"], true);
    }

    #[test]
    fn play_carries_format() {
        let msg = ClientMessage::Play {
            format: AudioFormat::S16le {
                sample_rate: 48000,
                channels: 2,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], "play");
        assert_eq!(json["format"]["encoding"], "s16le");
        assert_eq!(json["format"]["sample_rate"], 48000);

        let msg = ClientMessage::Play {
            format: AudioFormat::Passthrough,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["format"]["encoding"], "passthrough");
    }

    #[test]
    fn unit_ops_serialize() {
        assert_eq!(
            serde_json::to_string(&ClientMessage::Leave).unwrap(),
            r#"{"op":"leave"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientMessage::Stop).unwrap(),
            r#"{"op":"stop"}"#
        );
    }

    #[test]
    fn parse_state_update() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"op":"state","state":"connecting"}"#).unwrap();
        assert!(matches!(
            msg,
            ServerMessage::State {
                state: ConnectivityState::Connecting
            }
        ));
    }

    #[test]
    fn parse_error() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"op":"error","message":"missing permissions"}"#).unwrap();
        match msg {
            ServerMessage::Error { message } => assert_eq!(message, "missing permissions"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parse_unknown_op() {
        let msg: ServerMessage = serde_json::from_str(r#"{"op":"heartbeat_ack"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown));
    }
}

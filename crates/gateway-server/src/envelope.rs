// SPDX-License-Identifier: MIT
//! The `/ws` wire envelope: `{type, payload}` JSON frames, generalized
//! from the teacher's `ControlCommand`/`ControlEvent` pair to this
//! gateway's own inbound/outbound shapes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum InboundFrame {
    #[serde(rename = "channel.message")]
    ChannelMessage(ChannelMessagePayload),
    #[serde(rename = "admin.reset")]
    AdminReset,
    #[serde(rename = "admin.shutdown")]
    AdminShutdown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessagePayload {
    pub channel: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub is_group: bool,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum OutboundFrame {
    #[serde(rename = "agent.stream")]
    AgentStream { text: String },
    #[serde(rename = "tool.call")]
    ToolCall { call_id: String, name: String, args: serde_json::Value },
    #[serde(rename = "tool.result")]
    ToolResult { call_id: String, result_json: serde_json::Value, is_error: bool, duration_ms: u64 },
    #[serde(rename = "agent.response")]
    AgentResponse { text: String },
    #[serde(rename = "agent.done")]
    AgentDone { usage: UsagePayload },
    #[serde(rename = "gateway.error")]
    GatewayError { code: u16, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UsagePayload {
    #[serde(rename = "in")]
    pub input: usize,
    pub out: usize,
    pub total_estimate: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_message_frame_parses_from_tagged_json() {
        let json = r#"{"type":"channel.message","payload":{"channel":"local","senderId":"u1","senderName":null,"text":"hi","isGroup":false,"groupId":null}}"#;
        let frame: InboundFrame = serde_json::from_str(json).unwrap();
        match frame {
            InboundFrame::ChannelMessage(p) => assert_eq!(p.text, "hi"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn admin_reset_frame_parses_with_no_payload() {
        let json = r#"{"type":"admin.reset"}"#;
        let frame: InboundFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, InboundFrame::AdminReset));
    }

    #[test]
    fn outbound_agent_response_serializes_with_tagged_shape() {
        let frame = OutboundFrame::AgentResponse { text: "done".into() };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"agent.response\""));
        assert!(json.contains("\"text\":\"done\""));
    }
}

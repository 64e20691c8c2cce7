//! Channel message kind names.
//!
//! Each constant is the exact string carried in the `type` field of a
//! channel frame.

/// All channel message kinds, grouped by exchange.
pub struct MessageKinds;

impl MessageKinds {
    // ── Registration ────────────────────────────────────────────────────
    pub const REGISTER_CLIENT: &str = "register-client";
    pub const REGISTER_RESPONSE: &str = "register-response";
    pub const UNREGISTER_CLIENT: &str = "unregister-client";
    pub const UNREGISTER_RESPONSE: &str = "unregister-response";

    // ── Tool calls ──────────────────────────────────────────────────────
    pub const TOOL_CALL_REQUEST: &str = "tool-call-request";
    pub const TOOL_CALL_RESPONSE: &str = "tool-call-response";
}

/// Returns true if the given string names a known channel message kind.
pub fn is_known_kind(kind: &str) -> bool {
    matches!(
        kind,
        MessageKinds::REGISTER_CLIENT
            | MessageKinds::REGISTER_RESPONSE
            | MessageKinds::UNREGISTER_CLIENT
            | MessageKinds::UNREGISTER_RESPONSE
            | MessageKinds::TOOL_CALL_REQUEST
            | MessageKinds::TOOL_CALL_RESPONSE
    )
}

/// Message kinds are always `&str` at the protocol level.
pub type MessageKind = &'static str;

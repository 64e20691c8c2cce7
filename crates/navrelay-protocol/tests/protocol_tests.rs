//! Protocol layer tests: channel frames, validation, diagnostics, lock file.

#[cfg(test)]
mod tests {
    use navrelay_protocol::kinds::is_known_kind;
    use navrelay_protocol::*;
    use serde_json::json;

    fn registration(path: &str, id: &str) -> ClientRegistration {
        ClientRegistration::new(path, "repo", id, 4242)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Message kinds
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn known_kinds() {
        assert!(is_known_kind("register-client"));
        assert!(is_known_kind("unregister-response"));
        assert!(is_known_kind("tool-call-request"));
        assert!(!is_known_kind("disconnect"));
        assert!(!is_known_kind("tool-call"));
    }

    #[test]
    fn message_kind_matches_type_tag() {
        let msg = ChannelMessage::RegisterClient {
            request_id: "r1".into(),
            registration: registration("/repo/a", "c1"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], json!(msg.kind()));
        assert_eq!(value["requestId"], json!("r1"));
        assert_eq!(value["registration"]["workspacePath"], json!("/repo/a"));
        assert_eq!(value["registration"]["clientId"], json!("c1"));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Decoding
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn decode_register_without_timestamp() {
        let text = json!({
            "type": "register-client",
            "requestId": "r1",
            "registration": {
                "workspacePath": "/repo/a",
                "workspaceName": "a",
                "clientId": "c1",
                "pid": 10
            }
        })
        .to_string();
        let msg = ChannelMessage::decode(&text).unwrap();
        match msg {
            ChannelMessage::RegisterClient { registration, .. } => {
                assert_eq!(registration.client_id, "c1");
                assert_eq!(registration.pid, 10);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_tool_call_request() {
        let text = json!({
            "type": "tool-call-request",
            "requestId": "req-9",
            "toolName": "find_symbol",
            "args": {"name": "main"}
        })
        .to_string();
        let msg = ChannelMessage::decode(&text).unwrap();
        assert_eq!(msg.request_id(), "req-9");
        assert!(!msg.is_response());
        match msg {
            ChannelMessage::ToolCallRequest(req) => {
                assert_eq!(req.tool_name, "find_symbol");
                assert_eq!(req.workspace_hint(), None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = ChannelMessage::decode(r#"{"type":"disconnect","requestId":"x"}"#).unwrap_err();
        assert_eq!(err.error_code(), RelayErrorCode::ParseError);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = ChannelMessage::decode("not json").unwrap_err();
        assert_eq!(err.code, -32700);
    }

    #[test]
    fn decode_rejects_empty_request_id() {
        let text = json!({
            "type": "unregister-client",
            "requestId": "",
            "clientId": "c1"
        })
        .to_string();
        let err = ChannelMessage::decode(&text).unwrap_err();
        assert_eq!(err.error_code(), RelayErrorCode::InvalidRequest);
    }

    #[test]
    fn decode_rejects_registration_without_path() {
        let text = json!({
            "type": "register-client",
            "requestId": "r1",
            "registration": {
                "workspacePath": " ",
                "workspaceName": "a",
                "clientId": "c1",
                "pid": 10
            }
        })
        .to_string();
        let err = ChannelMessage::decode(&text).unwrap_err();
        assert_eq!(err.error_code(), RelayErrorCode::InvalidParams);
    }

    #[test]
    fn decode_rejects_response_with_result_and_error() {
        let text = json!({
            "type": "tool-call-response",
            "requestId": "r1",
            "result": 1,
            "error": "boom"
        })
        .to_string();
        assert!(ChannelMessage::decode(&text).is_err());
    }

    #[test]
    fn decode_rejects_non_object_args() {
        let text = json!({
            "type": "tool-call-request",
            "requestId": "r1",
            "toolName": "t",
            "args": [1, 2]
        })
        .to_string();
        assert!(ChannelMessage::decode(&text).is_err());
    }

    #[test]
    fn decode_rejects_failed_response_without_reason() {
        let text = json!({
            "type": "register-response",
            "requestId": "r1",
            "success": false
        })
        .to_string();
        assert!(ChannelMessage::decode(&text).is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tool calls
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn explicit_workspace_beats_args_hint() {
        let req = ToolCallRequest::new("r1", "t", json!({"workspace_path": "/repo/a"}))
            .with_workspace("/repo/b");
        assert_eq!(req.workspace_hint(), Some("/repo/b"));
    }

    #[test]
    fn args_hint_used_when_no_explicit_workspace() {
        let req = ToolCallRequest::new("r1", "t", json!({"workspace_path": "/repo/a"}));
        assert_eq!(req.workspace_hint(), Some("/repo/a"));
    }

    #[test]
    fn blank_hints_are_ignored() {
        let req = ToolCallRequest::new("r1", "t", json!({"workspace_path": ""}))
            .with_workspace("  ");
        assert_eq!(req.workspace_hint(), None);

        let req = ToolCallRequest::new("r1", "t", json!({"workspace_path": 7}));
        assert_eq!(req.workspace_hint(), None);
    }

    #[test]
    fn response_outcome() {
        let ok = ToolCallResponse::success("r1", json!({"found": true}));
        assert_eq!(ok.into_outcome(), Ok(json!({"found": true})));

        let failed = ToolCallResponse::failure("r1", "symbol not found");
        assert_eq!(failed.into_outcome(), Err("symbol not found".to_string()));

        let empty: ToolCallResponse =
            serde_json::from_value(json!({"requestId": "r1", "result": null})).unwrap();
        assert_eq!(empty.into_outcome(), Ok(serde_json::Value::Null));
    }

    #[test]
    fn response_frame_is_flat() {
        let msg = ChannelMessage::ToolCallResponse(ToolCallResponse::failure("r2", "nope"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "tool-call-response", "requestId": "r2", "error": "nope"})
        );
        assert!(msg.is_response());
    }

    #[test]
    fn invocation_hint_precedence() {
        let inv: ToolInvocation = serde_json::from_value(json!({
            "toolName": "read_file",
            "args": {"workspace_path": "/repo/a", "path": "x.rs"}
        }))
        .unwrap();
        assert_eq!(inv.workspace_hint(), Some("/repo/a"));
        let inv = inv.with_workspace("/repo/b");
        assert_eq!(inv.workspace_hint(), Some("/repo/b"));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Errors
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn error_codes_round_trip() {
        for code in [
            RelayErrorCode::NoClientAvailable,
            RelayErrorCode::AmbiguousWorkspace,
            RelayErrorCode::Timeout,
            RelayErrorCode::ClientGone,
            RelayErrorCode::ToolExecution,
            RelayErrorCode::ServerNotReady,
        ] {
            assert_eq!(RelayErrorCode::from_code(code.code()), code);
        }
        assert_eq!(RelayErrorCode::from_code(-1), RelayErrorCode::Custom(-1));
    }

    #[test]
    fn error_serialization_skips_empty_data() {
        let err = RelayError::no_client_available();
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], json!(-32010));
        assert!(value.get("data").is_none());

        let err = err.with_data(json!({"candidates": []}));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["data"], json!({"candidates": []}));
    }

    #[test]
    fn reply_body_shapes() {
        let ok = serde_json::to_value(ToolCallReply::ok(json!(3))).unwrap();
        assert_eq!(ok, json!({"result": 3}));

        let err = serde_json::to_value(ToolCallReply::err(RelayError::internal("x"))).unwrap();
        assert_eq!(err["error"]["code"], json!(-32603));
        assert!(err.get("result").is_none());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Diagnostics
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn health_status_shape() {
        let health = HealthStatus {
            status: "ok".into(),
            server: SERVER_IDENTITY.into(),
            server_pid: 77,
            clients: vec![registration("/repo/a", "c1").summary()],
            port: DEFAULT_PORT,
            state: ServiceState::IdleCountdown,
        };
        let value = serde_json::to_value(&health).unwrap();
        assert_eq!(value["serverPid"], json!(77));
        assert_eq!(value["state"], json!("idle-countdown"));
        assert_eq!(value["clients"][0]["workspacePath"], json!("/repo/a"));
        assert!(value["clients"][0].get("pid").is_none());
        assert!(health.is_ok());
    }

    #[test]
    fn client_list_counts() {
        let list = ClientList::new(vec![registration("/a", "c1"), registration("/b", "c2")]);
        let value = serde_json::to_value(&list).unwrap();
        assert_eq!(value["totalClients"], json!(2));
        assert_eq!(value["clients"][1]["clientId"], json!("c2"));
    }

    #[test]
    fn service_state_accepting() {
        assert!(ServiceState::Serving.is_accepting());
        assert!(ServiceState::IdleCountdown.is_accepting());
        assert!(!ServiceState::Initializing.is_accepting());
        assert!(!ServiceState::Terminated.is_accepting());
        assert_eq!(ServiceState::IdleCountdown.to_string(), "idle-countdown");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lock file
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn lock_file_record_fields() {
        let mut record = LockFileRecord::new(123, 8010, chrono::Utc::now());
        record.refresh([&registration("/repo/a", "c1")]);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["serverPid"], json!(123));
        assert_eq!(value["serverType"], json!(SERVER_IDENTITY));
        assert_eq!(value["isDetached"], json!(true));
        assert_eq!(value["clients"][0]["pid"], json!(4242));
        assert!(value.get("startTime").is_some());
        assert!(value.get("lastUpdate").is_some());
    }

    #[test]
    fn lock_file_accepts_minimal_record() {
        let record: LockFileRecord = serde_json::from_value(json!({
            "serverPid": 1,
            "port": 9000,
            "startTime": "2024-01-01T00:00:00Z",
            "clientsSnapshot": [],
            "lastUpdate": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.port, 9000);
        assert_eq!(record.server_type, SERVER_IDENTITY);
        assert!(record.clients.is_empty());
    }

    #[test]
    fn default_lock_path_uses_temp_dir() {
        let path = default_lock_file_path();
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.ends_with(LOCK_FILE_NAME));
    }
}

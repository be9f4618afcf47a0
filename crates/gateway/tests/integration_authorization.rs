mod common;

use common::{definition, error_code, open_session, responder_script, start_gateway, TestClient, TestGateway};
use serde_json::json;
use std::time::Duration;
use toolgate_gateway::permissions::PermissionCategory;
use toolgate_gateway::supervisor::InstanceStatus;

const TOOLS: &str = r#"[{"name":"reader","description":"reads things","permissions":{"categories":["READ_REMOTE"]}},{"name":"writer","description":"writes things","permissions":{"categories":["WRITE_REMOTE"]}}]"#;

async fn discover(fixture: &TestGateway, name: &str) {
    fixture.registry.start_server(name).await.unwrap();
    let instance = fixture.registry.server(name).unwrap();
    for _ in 0..100 {
        if !instance.tools().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("tool discovery timed out");
}

fn call(session_id: &str, tool: &str) -> serde_json::Value {
    json!({"sessionId": session_id, "name": tool, "arguments": {}})
}

#[tokio::test]
async fn supervisor_discovers_tools_and_reports_status() {
    let scripts = tempfile::TempDir::new().unwrap();
    let script = responder_script(scripts.path(), "tools.sh", TOOLS);
    let fixture = start_gateway(vec![definition("Tools", &script)]).await;

    discover(&fixture, "Tools").await;
    let instance = fixture.registry.server("Tools").unwrap();
    assert_eq!(instance.status(), InstanceStatus::Running);

    let names: Vec<String> = instance.tools().iter().map(|t| t.name.clone()).collect();
    assert_eq!(names, vec!["reader", "writer"]);

    fixture.registry.stop_server("Tools").await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Stopped);
}

#[tokio::test]
async fn category_permissions_gate_tool_calls() {
    let scripts = tempfile::TempDir::new().unwrap();
    let script = responder_script(scripts.path(), "tools.sh", TOOLS);
    let fixture = start_gateway(vec![definition("Tools", &script)]).await;
    discover(&fixture, "Tools").await;

    let mut client = TestClient::connect(fixture.port).await;
    let session_id = open_session(
        &mut client,
        json!({"serverType": "Tools", "credentials": {"token": "x"}}),
    )
    .await;

    // READ_REMOTE is permitted by default, WRITE_REMOTE is not.
    let resp = client.request(5, "tools/call", call(&session_id, "reader")).await;
    assert!(resp.get("error").is_none(), "reader should pass: {resp}");

    let resp = client.request(6, "tools/call", call(&session_id, "writer")).await;
    assert_eq!(error_code(&resp), -32003);
    assert_eq!(
        resp["error"]["message"],
        "Tool 'writer' blocked: insufficient permissions for server 'Tools'"
    );

    // A per-server override opens the category without touching globals.
    let instance = fixture.registry.server("Tools").unwrap();
    instance.set_permission(PermissionCategory::WriteRemote, Some(true));
    let resp = client.request(7, "tools/call", call(&session_id, "writer")).await;
    assert!(resp.get("error").is_none(), "override should pass: {resp}");
}

#[tokio::test]
async fn disabled_tools_are_rejected_before_anything_else() {
    let scripts = tempfile::TempDir::new().unwrap();
    let script = responder_script(scripts.path(), "tools.sh", TOOLS);
    let fixture = start_gateway(vec![definition("Tools", &script)]).await;
    discover(&fixture, "Tools").await;

    let instance = fixture.registry.server("Tools").unwrap();
    instance.set_tool_enabled("reader", false);

    let mut client = TestClient::connect(fixture.port).await;
    let session_id = open_session(
        &mut client,
        json!({"serverType": "Tools", "credentials": {"token": "x"}}),
    )
    .await;

    let resp = client.request(5, "tools/call", call(&session_id, "reader")).await;
    assert_eq!(error_code(&resp), -32001);
    assert_eq!(
        resp["error"]["message"],
        "Tool 'reader' is disabled for server 'Tools'"
    );
}

#[tokio::test]
async fn user_allowlist_overrides_categories() {
    let scripts = tempfile::TempDir::new().unwrap();
    let script = responder_script(scripts.path(), "tools.sh", TOOLS);
    let fixture = start_gateway(vec![definition("Tools", &script)]).await;
    discover(&fixture, "Tools").await;

    fixture
        .keystore
        .set_user_credential("u@x.com", "tools", "token", "x")
        .unwrap();
    fixture
        .keystore
        .set_user_permissions("u@x.com", "tools", &["writer".to_string()])
        .unwrap();

    let mut client = TestClient::connect(fixture.port).await;
    let session_id = open_session(
        &mut client,
        json!({"serverType": "Tools", "userId": "u@x.com"}),
    )
    .await;

    // Allowlisted tools skip the category check entirely, even though
    // WRITE_REMOTE is denied by default.
    let resp = client.request(5, "tools/call", call(&session_id, "writer")).await;
    assert!(resp.get("error").is_none(), "allowlisted should pass: {resp}");

    // Anything off the allowlist is denied, even default-permitted reads.
    let resp = client.request(6, "tools/call", call(&session_id, "reader")).await;
    assert_eq!(error_code(&resp), -32004);
}

#[tokio::test]
async fn block_all_marker_denies_everything() {
    let scripts = tempfile::TempDir::new().unwrap();
    let script = responder_script(scripts.path(), "tools.sh", TOOLS);
    let fixture = start_gateway(vec![definition("Tools", &script)]).await;
    discover(&fixture, "Tools").await;

    fixture
        .keystore
        .set_user_credential("b@x.com", "tools", "token", "x")
        .unwrap();
    fixture
        .keystore
        .set_user_permissions("b@x.com", "tools", &["__BLOCK_ALL__".to_string()])
        .unwrap();

    let mut client = TestClient::connect(fixture.port).await;
    let session_id = open_session(
        &mut client,
        json!({"serverType": "Tools", "userId": "b@x.com"}),
    )
    .await;

    let resp = client.request(5, "tools/call", call(&session_id, "reader")).await;
    assert_eq!(error_code(&resp), -32005);
}

#[tokio::test]
async fn permission_changes_tear_down_affected_sessions() {
    let scripts = tempfile::TempDir::new().unwrap();
    let script = responder_script(scripts.path(), "tools.sh", TOOLS);
    let fixture = start_gateway(vec![
        definition("Alpha", &script),
        definition("Beta", &script),
    ])
    .await;

    let mut client = TestClient::connect(fixture.port).await;
    open_session(
        &mut client,
        json!({"serverType": "Alpha", "credentials": {"token": "x"}}),
    )
    .await;
    open_session(
        &mut client,
        json!({"serverType": "Beta", "credentials": {"token": "x"}}),
    )
    .await;

    let resp = client.request(3, "mcp-manager/list-sessions", json!({})).await;
    assert_eq!(resp["result"]["count"], 2);

    // A per-server change only evicts that server's sessions.
    fixture
        .registry
        .set_server_permission("Alpha", PermissionCategory::ReadRemote, Some(false))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let resp = client.request(4, "mcp-manager/list-sessions", json!({})).await;
    assert_eq!(resp["result"]["count"], 1);
    assert_eq!(resp["result"]["sessions"][0]["serverType"], "Beta");

    // A global change evicts everything.
    fixture
        .registry
        .set_global_permission(PermissionCategory::ReadRemote, false)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let resp = client.request(5, "mcp-manager/list-sessions", json!({})).await;
    assert_eq!(resp["result"]["count"], 0);
}

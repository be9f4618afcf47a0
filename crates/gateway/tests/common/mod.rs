//! Shared fixtures: fake MCP servers written as shell scripts, a gateway
//! bootstrapped on an ephemeral port, and a line-oriented test client.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use toolgate_gateway::config::{GatewayConfig, ServerDefinition};
use toolgate_gateway::gateway::Gateway;
use toolgate_gateway::registry::Registry;
use toolgate_keystore::Keystore;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// A server that completes both handshakes (supervisor and session), serves
/// the given tools/list payload, and echoes everything else back verbatim.
pub fn responder_script(dir: &Path, name: &str, tools_json: &str) -> PathBuf {
    let body = format!(
        r#"while read line; do
  case "$line" in
    *'"id":1,'*'"method":"initialize"'*)
      echo '{{"jsonrpc":"2.0","id":1,"result":{{"protocolVersion":"2024-11-05"}}}}'
      ;;
    *'"id":999,'*'"method":"initialize"'*)
      echo '{{"jsonrpc":"2.0","id":999,"result":{{"protocolVersion":"2024-11-05"}}}}'
      ;;
    *'"id":999,'*'"method":"tools/list"'*)
      echo '{{"jsonrpc":"2.0","id":999,"result":{{"tools":{tools_json}}}}}'
      ;;
    *'"method":"notifications/initialized"'*)
      ;;
    *)
      echo "$line"
      ;;
  esac
done
"#
    );
    write_script(dir, name, &body)
}

pub fn definition(name: &str, command: &Path) -> ServerDefinition {
    ServerDefinition {
        name: name.to_string(),
        server_type: "stdio".to_string(),
        command: command.display().to_string(),
        port: 18080,
        ..Default::default()
    }
}

pub struct TestGateway {
    pub port: u16,
    pub registry: Arc<Registry>,
    pub keystore: Arc<Keystore>,
    pub gateway: Arc<Gateway>,
    pub dir: tempfile::TempDir,
}

pub async fn start_gateway(servers: Vec<ServerDefinition>) -> TestGateway {
    let dir = tempfile::TempDir::new().unwrap();
    let keystore = Arc::new(Keystore::open(dir.path()).unwrap());
    let config = GatewayConfig {
        servers,
        ..Default::default()
    };
    let registry = Registry::new(dir.path().join("toolgate.json"), config);
    let gateway = Gateway::new(Arc::clone(&registry), Arc::clone(&keystore));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(Arc::clone(&gateway).serve(listener));
    TestGateway {
        port,
        registry,
        keystore,
        gateway,
        dir,
    }
}

pub struct TestClient {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read).lines(),
            writer,
        }
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send(&mut self, msg: Value) {
        let line = serde_json::to_string(&msg).unwrap();
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.reader.next_line())
            .await
            .expect("timed out waiting for a response")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Read messages until one carries the given id, skipping notifications
    /// and unrelated traffic.
    pub async fn recv_matching(&mut self, id: i64) -> Value {
        loop {
            let msg = self.recv().await;
            if msg.get("id").and_then(Value::as_i64) == Some(id) {
                return msg;
            }
        }
    }

    pub async fn request(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await;
        self.recv_matching(id).await
    }
}

pub fn error_code(msg: &Value) -> i64 {
    msg["error"]["code"].as_i64().expect("expected an error response")
}

/// Create a session over the wire and return its id.
pub async fn open_session(client: &mut TestClient, params: Value) -> String {
    let resp = client.request(1, "mcp-manager/create-session", params).await;
    resp["result"]["sessionId"]
        .as_str()
        .unwrap_or_else(|| panic!("create-session failed: {resp}"))
        .to_string()
}

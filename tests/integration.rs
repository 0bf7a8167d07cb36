use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn forge_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("brief-forge");
    path
}

/// Grab a free port by binding to 0 and releasing it.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn setup_test_env(port: u16) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let config_content = format!(
        r#"[server]
bind = "127.0.0.1:{}"

[db]
path = "{}/data/brief-forge.sqlite"

[auth]
secret_key = "integration-test-secret-key"
token_ttl_minutes = 30
admin_emails = ["admin@example.com"]
"#,
        port,
        root.display()
    );

    let config_path = config_dir.join("brief-forge.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_forge(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = forge_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run brief-forge binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Running API server that is killed when the guard drops.
struct ServerGuard {
    child: Child,
    base_url: String,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn start_server(config_path: &Path, port: u16) -> ServerGuard {
    run_forge(config_path, &["init"]);

    let child = Command::new(forge_binary())
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("serve")
        .spawn()
        .expect("Failed to spawn server");

    let guard = ServerGuard {
        child,
        base_url: format!("http://127.0.0.1:{}", port),
    };

    // Wait for the health endpoint to come up.
    let client = reqwest::blocking::Client::new();
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(resp) = client
            .get(format!("{}/api/v1/health", guard.base_url))
            .send()
        {
            if resp.status().is_success() {
                break;
            }
        }
        if Instant::now() > deadline {
            panic!("Server did not start within 15s");
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    guard
}

fn register_and_login(client: &reqwest::blocking::Client, base_url: &str, email: &str) -> String {
    let resp = client
        .post(format!("{}/api/v1/auth/register", base_url))
        .json(&serde_json::json!({
            "email": email,
            "password": "test-password-123",
            "company_name": "Test Co"
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201, "register failed");

    let resp = client
        .post(format!("{}/api/v1/auth/login", base_url))
        .json(&serde_json::json!({
            "email": email,
            "password": "test-password-123"
        }))
        .send()
        .unwrap();
    assert!(resp.status().is_success(), "login failed");
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["token_type"], "bearer");
    body["access_token"].as_str().unwrap().to_string()
}

#[test]
fn test_init_creates_database() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);

    let (stdout, stderr, success) = run_forge(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);

    let (_, _, success1) = run_forge(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_forge(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_health_and_root() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let body: serde_json::Value = client
        .get(format!("{}/api/v1/health", server.base_url))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "connected");

    let body: serde_json::Value = client
        .get(&server.base_url)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert!(body["message"].as_str().unwrap().contains("Brief Forge"));
}

#[test]
fn test_register_login_me() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let token = register_and_login(&client, &server.base_url, "seller@example.com");

    let resp = client
        .get(format!("{}/api/v1/auth/me", server.base_url))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["email"], "seller@example.com");
    assert_eq!(body["plan"], "free");
    // The password hash must never be serialized.
    assert!(body.get("password_hash").is_none());
}

#[test]
fn test_register_duplicate_email_rejected() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    register_and_login(&client, &server.base_url, "dup@example.com");

    let resp = client
        .post(format!("{}/api/v1/auth/register", server.base_url))
        .json(&serde_json::json!({
            "email": "dup@example.com",
            "password": "another-password"
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("already registered"));
}

#[test]
fn test_login_wrong_password_unauthorized() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    register_and_login(&client, &server.base_url, "locked@example.com");

    let resp = client
        .post(format!("{}/api/v1/auth/login", server.base_url))
        .json(&serde_json::json!({
            "email": "locked@example.com",
            "password": "wrong-password"
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}

#[test]
fn test_protected_route_requires_token() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let resp = client
        .get(format!("{}/api/v1/shops", server.base_url))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    assert_eq!(resp.headers().get("www-authenticate").unwrap(), "Bearer");
}

#[test]
fn test_shops_crud() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let token = register_and_login(&client, &server.base_url, "shops@example.com");

    // Create
    let resp = client
        .post(format!("{}/api/v1/shops", server.base_url))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "shop_name": "My Pet Shop",
            "market": "US",
            "category": "Pet Supplies"
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let shop: serde_json::Value = resp.json().unwrap();
    let shop_id = shop["id"].as_str().unwrap().to_string();
    assert_eq!(shop["shop_name"], "My Pet Shop");
    assert_eq!(shop["is_active"], true);

    // List
    let shops: serde_json::Value = client
        .get(format!("{}/api/v1/shops", server.base_url))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(shops.as_array().unwrap().len(), 1);

    // Update
    let resp = client
        .patch(format!("{}/api/v1/shops/{}", server.base_url, shop_id))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "shop_name": "Renamed Shop", "is_active": false }))
        .send()
        .unwrap();
    assert!(resp.status().is_success());
    let updated: serde_json::Value = resp.json().unwrap();
    assert_eq!(updated["shop_name"], "Renamed Shop");
    assert_eq!(updated["is_active"], false);
    // Unchanged fields survive a partial update.
    assert_eq!(updated["market"], "US");

    // Delete
    let resp = client
        .delete(format!("{}/api/v1/shops/{}", server.base_url, shop_id))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    let resp = client
        .get(format!("{}/api/v1/shops/{}", server.base_url, shop_id))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[test]
fn test_shop_isolation_between_tenants() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let token_a = register_and_login(&client, &server.base_url, "tenant-a@example.com");
    let token_b = register_and_login(&client, &server.base_url, "tenant-b@example.com");

    let shop: serde_json::Value = client
        .post(format!("{}/api/v1/shops", server.base_url))
        .bearer_auth(&token_a)
        .json(&serde_json::json!({ "shop_name": "A's Shop" }))
        .send()
        .unwrap()
        .json()
        .unwrap();
    let shop_id = shop["id"].as_str().unwrap();

    // Another tenant sees 404, not 403: the shop's existence is not leaked.
    let resp = client
        .get(format!("{}/api/v1/shops/{}", server.base_url, shop_id))
        .bearer_auth(&token_b)
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let shops: serde_json::Value = client
        .get(format!("{}/api/v1/shops", server.base_url))
        .bearer_auth(&token_b)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(shops.as_array().unwrap().len(), 0);
}

#[test]
fn test_knowledge_crud_without_vector_backend() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let token = register_and_login(&client, &server.base_url, "kb@example.com");

    let resp = client
        .post(format!("{}/api/v1/knowledge", server.base_url))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "title": "Hook that works",
            "content": "Open with the price objection.",
            "category": "hook",
            "performance_score": 0.92
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let entry: serde_json::Value = resp.json().unwrap();
    let entry_id = entry["id"].as_str().unwrap().to_string();
    // No embedding provider configured, so the entry is unindexed.
    assert!(entry["vector_id"].is_null());

    // Category filter
    let entries: serde_json::Value = client
        .get(format!("{}/api/v1/knowledge?category=hook", server.base_url))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 1);

    let entries: serde_json::Value = client
        .get(format!(
            "{}/api/v1/knowledge?category=script",
            server.base_url
        ))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 0);

    // Update
    let resp = client
        .patch(format!("{}/api/v1/knowledge/{}", server.base_url, entry_id))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "content": "Open with a bold claim instead." }))
        .send()
        .unwrap();
    assert!(resp.status().is_success());
    let updated: serde_json::Value = resp.json().unwrap();
    assert_eq!(updated["content"], "Open with a bold claim instead.");
    assert_eq!(updated["title"], "Hook that works");
    // A content change triggers re-embedding; with no embedding backend the
    // entry must come back unindexed rather than pointing at stale text.
    assert!(updated["vector_id"].is_null());

    // Delete
    let resp = client
        .delete(format!("{}/api/v1/knowledge/{}", server.base_url, entry_id))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);
}

#[test]
fn test_admin_knowledge_requires_admin() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let user_token = register_and_login(&client, &server.base_url, "plain@example.com");
    let admin_token = register_and_login(&client, &server.base_url, "admin@example.com");

    let resp = client
        .post(format!("{}/api/v1/admin/knowledge", server.base_url))
        .bearer_auth(&user_token)
        .json(&serde_json::json!({ "title": "T", "content": "C" }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "forbidden");

    let resp = client
        .post(format!("{}/api/v1/admin/knowledge", server.base_url))
        .bearer_auth(&admin_token)
        .json(&serde_json::json!({
            "title": "Platform hook playbook",
            "content": "Patterns that keep working across niches."
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);

    let entries: serde_json::Value = client
        .get(format!("{}/api/v1/admin/knowledge", server.base_url))
        .bearer_auth(&admin_token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 1);
}

#[test]
fn test_market_trends_empty() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let token = register_and_login(&client, &server.base_url, "trends@example.com");

    let trends: serde_json::Value = client
        .get(format!("{}/api/v1/market/trends", server.base_url))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(trends.as_array().unwrap().len(), 0);

    let gems: serde_json::Value = client
        .get(format!("{}/api/v1/market/hidden-gems", server.base_url))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(gems.as_array().unwrap().len(), 0);
}

#[test]
fn test_image_proxy_rejects_unlisted_host() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let resp = client
        .get(format!(
            "{}/api/v1/fastmoss/image-proxy?url=https://evil.example.com/x.jpg",
            server.base_url
        ))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    let resp = client
        .get(format!(
            "{}/api/v1/fastmoss/image-proxy?url=not-a-url",
            server.base_url
        ))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[test]
fn test_conversations_listing_and_missing() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    let server = start_server(&config_path, port);
    let client = reqwest::blocking::Client::new();

    let token = register_and_login(&client, &server.base_url, "chat@example.com");

    // No conversations yet.
    let conversations: serde_json::Value = client
        .get(format!("{}/api/v1/copilot/conversations", server.base_url))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(conversations.as_array().unwrap().len(), 0);

    // Unknown conversation is a 404.
    let resp = client
        .get(format!(
            "{}/api/v1/copilot/conversations/00000000-0000-0000-0000-000000000000",
            server.base_url
        ))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

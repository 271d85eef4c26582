// Copyright (c) 2024 Botho Foundation

//! In-process rendezvous server speaking the JSON-over-HTTP protocol.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::SystemTime};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

#[derive(Default)]
struct State {
    devices: HashMap<String, Value>,
    connect_requests: HashMap<String, Vec<Value>>,
}

/// Minimal rendezvous service on a loopback port.
pub struct TestRendezvousServer {
    pub url: String,
    /// Every request body received, in order.
    pub log: Arc<Mutex<Vec<Value>>>,
    state: Arc<Mutex<State>>,
}

impl TestRendezvousServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(Mutex::new(State::default()));

        let (server_log, server_state) = (log.clone(), state.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, server_log.clone(), server_state.clone()));
            }
        });

        Self { url, log, state }
    }

    /// Drop a registration as if it had expired.
    pub fn expire(&self, device_id: &str) {
        self.state.lock().devices.remove(device_id);
    }

    pub fn is_registered(&self, device_id: &str) -> bool {
        self.state.lock().devices.contains_key(device_id)
    }

    pub fn actions(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|body| body["action"].as_str().map(str::to_string))
            .collect()
    }
}

async fn serve(mut stream: TcpStream, log: Arc<Mutex<Vec<Value>>>, state: Arc<Mutex<State>>) {
    let Some(body) = read_request(&mut stream).await else {
        return;
    };
    let (status, response) = match serde_json::from_slice::<Value>(&body) {
        Ok(request) => {
            log.lock().push(request.clone());
            handle(&mut state.lock(), &request)
        }
        Err(_) => (400, json!({ "error": "Invalid JSON" })),
    };

    let body = response.to_string();
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        if status == 200 { "OK" } else { "Error" },
        body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Read one request and return its body.
async fn read_request(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(buf[header_end..header_end + content_length].to_vec())
}

fn handle(state: &mut State, request: &Value) -> (u16, Value) {
    let field = |name: &str| request[name].as_str().unwrap_or_default().to_string();

    match request["action"].as_str().unwrap_or_default() {
        "register" => {
            let device_id = field("device_id");
            if device_id.is_empty() || request["public_addr"].is_null() {
                return (400, json!({ "error": "Missing device_id or public_addr" }));
            }
            state.devices.insert(
                device_id.clone(),
                json!({
                    "device_id": device_id,
                    "public_addr": request["public_addr"],
                    "local_addr": request["local_addr"],
                }),
            );
            (200, json!({ "status": "ok", "message": "Device registered" }))
        }
        "lookup" => match state.devices.get(&field("device_id")) {
            Some(info) => (200, json!({ "status": "ok", "device_info": info })),
            None => (404, json!({ "status": "not_found", "error": "Device not found" })),
        },
        "heartbeat" => {
            if state.devices.contains_key(&field("device_id")) {
                (200, json!({ "status": "ok" }))
            } else {
                (404, json!({ "error": "Device not registered" }))
            }
        }
        "unregister" => match state.devices.remove(&field("device_id")) {
            Some(_) => (200, json!({ "status": "ok" })),
            None => (404, json!({ "error": "Device not found" })),
        },
        "connect_request" => {
            let (requester, target) = (field("requester_id"), field("target_id"));
            let (Some(requester_info), Some(target_info)) =
                (state.devices.get(&requester).cloned(), state.devices.get(&target).cloned())
            else {
                return (404, json!({ "status": "not_found", "error": "Device not found" }));
            };
            let timestamp = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs_f64())
                .unwrap_or_default();
            state.connect_requests.entry(target).or_default().push(json!({
                "requester_id": requester,
                "requester_info": requester_info,
                "timestamp": timestamp,
            }));
            (200, json!({ "status": "ok", "target_info": target_info }))
        }
        "get_connect_requests" => {
            let requests = state
                .connect_requests
                .get(&field("device_id"))
                .cloned()
                .unwrap_or_default();
            (200, json!({ "status": "ok", "requests": requests }))
        }
        "clear_connect_request" => {
            let requester = field("requester_id");
            if let Some(pending) = state.connect_requests.get_mut(&field("target_id")) {
                pending.retain(|request| request["requester_id"].as_str() != Some(requester.as_str()));
            }
            (200, json!({ "status": "ok", "cleared": true }))
        }
        _ => (400, json!({ "error": "Unknown action" })),
    }
}

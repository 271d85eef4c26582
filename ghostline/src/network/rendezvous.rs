// Copyright (c) 2024 Botho Foundation

//! Rendezvous discovery client.
//!
//! The rendezvous service maps device ids to `{public_addr, local_addr}` so
//! peers can find each other without exchanging addresses by hand, and it
//! relays connect requests used to coordinate hole punching. It only ever
//! sees ids and addresses.
//!
//! Every call is an HTTP POST of a JSON object to `<base>/api` with an
//! `action` field. Registrations expire server-side unless refreshed, so a
//! registered node runs [`spawn_heartbeat`].

use crate::identity::DeviceId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default rendezvous server.
pub const DEFAULT_RENDEZVOUS_URL: &str = "http://127.0.0.1:8080";

/// Timeout for one rendezvous request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat period; the server forgets a device after 300s of silence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Errors from the rendezvous service.
#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("rendezvous request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server no longer knows this device.
    #[error("device not registered")]
    NotRegistered,

    #[error("rendezvous server rejected request: {0}")]
    Rejected(String),

    #[error("invalid rendezvous response: {0}")]
    InvalidResponse(String),
}

/// Where a device can be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerAddressInfo {
    pub public_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

impl PeerAddressInfo {
    pub fn new(public_addr: Option<SocketAddr>, local_addr: Option<SocketAddr>) -> Self {
        Self {
            public_addr,
            local_addr,
        }
    }
}

/// A pending request from `requester` to be dialed back.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub requester: DeviceId,
    pub info: PeerAddressInfo,
    /// Server time the request was posted, seconds since the epoch.
    pub timestamp: f64,
}

/// Operations of the rendezvous service.
#[async_trait]
pub trait RendezvousClient: Send + Sync {
    async fn register(&self, device: DeviceId, info: PeerAddressInfo) -> Result<(), RendezvousError>;

    /// `Ok(None)` when the device is unknown or expired.
    async fn lookup(&self, device: DeviceId) -> Result<Option<PeerAddressInfo>, RendezvousError>;

    async fn heartbeat(&self, device: DeviceId) -> Result<(), RendezvousError>;

    async fn unregister(&self, device: DeviceId) -> Result<(), RendezvousError>;

    /// Ask `target` to dial `requester` back. Returns the target's addresses,
    /// or `None` if either side is not registered.
    async fn request_connect(
        &self,
        requester: DeviceId,
        target: DeviceId,
    ) -> Result<Option<PeerAddressInfo>, RendezvousError>;

    async fn pending_connect_requests(&self, device: DeviceId) -> Result<Vec<ConnectRequest>, RendezvousError>;

    async fn clear_connect_request(&self, target: DeviceId, requester: DeviceId) -> Result<(), RendezvousError>;
}

/// `{ip, port}` as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireAddr {
    ip: String,
    port: u16,
}

impl From<SocketAddr> for WireAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl WireAddr {
    fn to_socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Deserialize)]
struct WireDeviceInfo {
    #[serde(default)]
    public_addr: Option<WireAddr>,
    #[serde(default)]
    local_addr: Option<WireAddr>,
}

impl From<WireDeviceInfo> for PeerAddressInfo {
    fn from(info: WireDeviceInfo) -> Self {
        Self {
            public_addr: info.public_addr.as_ref().and_then(WireAddr::to_socket_addr),
            local_addr: info.local_addr.as_ref().and_then(WireAddr::to_socket_addr),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireConnectRequest {
    requester_id: String,
    requester_info: WireDeviceInfo,
    #[serde(default)]
    timestamp: f64,
}

#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    device_info: Option<WireDeviceInfo>,
    #[serde(default)]
    target_info: Option<WireDeviceInfo>,
    #[serde(default)]
    requests: Vec<WireConnectRequest>,
}

impl ApiResponse {
    fn is_ok(&self) -> bool {
        self.status.as_deref() == Some("ok")
    }

    fn is_not_found(&self) -> bool {
        self.status.as_deref() == Some("not_found")
    }

    fn rejection(self) -> RendezvousError {
        RendezvousError::Rejected(self.error.unwrap_or_else(|| "unknown error".to_string()))
    }
}

/// [`RendezvousClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRendezvousClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRendezvousClient {
    pub fn new(base_url: &str) -> Result<Self, RendezvousError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, RendezvousError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST one action. Error statuses still carry a JSON body, which is
    /// returned so callers can tell `not_found` from a rejection.
    async fn call(&self, body: Value) -> Result<ApiResponse, RendezvousError> {
        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<ApiResponse>(&text) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(RendezvousError::Rejected(format!("HTTP {}", status))),
            Err(e) => Err(RendezvousError::InvalidResponse(e.to_string())),
        }
    }
}

#[async_trait]
impl RendezvousClient for HttpRendezvousClient {
    async fn register(&self, device: DeviceId, info: PeerAddressInfo) -> Result<(), RendezvousError> {
        // The server requires a public address; fall back to the local one.
        let Some(public) = info.public_addr.or(info.local_addr) else {
            return Err(RendezvousError::Rejected("no address to register".to_string()));
        };
        let response = self
            .call(json!({
                "action": "register",
                "device_id": device.to_string(),
                "public_addr": WireAddr::from(public),
                "local_addr": info.local_addr.map(WireAddr::from),
            }))
            .await?;

        if response.is_ok() {
            info!(device = %device.short(), "Registered with rendezvous at {}", public);
            Ok(())
        } else {
            Err(response.rejection())
        }
    }

    async fn lookup(&self, device: DeviceId) -> Result<Option<PeerAddressInfo>, RendezvousError> {
        let response = self
            .call(json!({ "action": "lookup", "device_id": device.to_string() }))
            .await?;

        if response.is_not_found() {
            debug!(device = %device.short(), "Rendezvous lookup: not found");
            return Ok(None);
        }
        if !response.is_ok() {
            return Err(response.rejection());
        }
        let info = response
            .device_info
            .ok_or_else(|| RendezvousError::InvalidResponse("missing device_info".to_string()))?;
        Ok(Some(info.into()))
    }

    async fn heartbeat(&self, device: DeviceId) -> Result<(), RendezvousError> {
        let response = self
            .call(json!({ "action": "heartbeat", "device_id": device.to_string() }))
            .await?;

        if response.is_ok() {
            Ok(())
        } else {
            Err(RendezvousError::NotRegistered)
        }
    }

    async fn unregister(&self, device: DeviceId) -> Result<(), RendezvousError> {
        let response = self
            .call(json!({ "action": "unregister", "device_id": device.to_string() }))
            .await?;

        if response.is_ok() {
            Ok(())
        } else {
            Err(RendezvousError::NotRegistered)
        }
    }

    async fn request_connect(
        &self,
        requester: DeviceId,
        target: DeviceId,
    ) -> Result<Option<PeerAddressInfo>, RendezvousError> {
        let response = self
            .call(json!({
                "action": "connect_request",
                "requester_id": requester.to_string(),
                "target_id": target.to_string(),
            }))
            .await?;

        if response.is_not_found() {
            return Ok(None);
        }
        if !response.is_ok() {
            return Err(response.rejection());
        }
        Ok(response.target_info.map(PeerAddressInfo::from))
    }

    async fn pending_connect_requests(&self, device: DeviceId) -> Result<Vec<ConnectRequest>, RendezvousError> {
        let response = self
            .call(json!({ "action": "get_connect_requests", "device_id": device.to_string() }))
            .await?;

        if !response.is_ok() {
            return Err(response.rejection());
        }

        let mut requests = Vec::with_capacity(response.requests.len());
        for request in response.requests {
            match request.requester_id.parse::<DeviceId>() {
                Ok(requester) => requests.push(ConnectRequest {
                    requester,
                    info: request.requester_info.into(),
                    timestamp: request.timestamp,
                }),
                Err(_) => warn!("Skipping connect request with invalid requester id"),
            }
        }
        Ok(requests)
    }

    async fn clear_connect_request(&self, target: DeviceId, requester: DeviceId) -> Result<(), RendezvousError> {
        let response = self
            .call(json!({
                "action": "clear_connect_request",
                "target_id": target.to_string(),
                "requester_id": requester.to_string(),
            }))
            .await?;

        if response.is_ok() {
            Ok(())
        } else {
            Err(response.rejection())
        }
    }
}

/// Keep `device` registered until `cancel` fires, then unregister.
///
/// A heartbeat answered with [`RendezvousError::NotRegistered`] means the
/// server expired the registration; it is re-registered with `info`.
pub fn spawn_heartbeat(
    client: Arc<dyn RendezvousClient>,
    device: DeviceId,
    info: PeerAddressInfo,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; registration already happened.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match client.heartbeat(device).await {
                        Ok(()) => debug!(device = %device.short(), "Rendezvous heartbeat"),
                        Err(RendezvousError::NotRegistered) => {
                            info!("Rendezvous registration expired, re-registering");
                            if let Err(e) = client.register(device, info).await {
                                warn!("Rendezvous re-registration failed: {}", e);
                            }
                        }
                        Err(e) => warn!("Rendezvous heartbeat failed: {}", e),
                    }
                }
            }
        }

        if let Err(e) = client.unregister(device).await {
            debug!("Rendezvous unregister failed: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_addr_roundtrip() {
        let addr: SocketAddr = "203.0.113.5:4242".parse().unwrap();
        let wire = WireAddr::from(addr);
        assert_eq!(wire.ip, "203.0.113.5");
        assert_eq!(wire.to_socket_addr(), Some(addr));

        let bad = WireAddr {
            ip: "not-an-ip".to_string(),
            port: 1,
        };
        assert_eq!(bad.to_socket_addr(), None);
    }

    #[test]
    fn test_parse_lookup_response() {
        let body = r#"{
            "status": "ok",
            "device_info": {
                "device_id": "abc",
                "public_addr": {"ip": "198.51.100.1", "port": 5000},
                "local_addr": {"ip": "192.168.0.9", "port": 5000}
            }
        }"#;
        let response: ApiResponse = serde_json::from_str(body).unwrap();
        assert!(response.is_ok());
        let info: PeerAddressInfo = response.device_info.unwrap().into();
        assert_eq!(info.public_addr, Some("198.51.100.1:5000".parse().unwrap()));
        assert_eq!(info.local_addr, Some("192.168.0.9:5000".parse().unwrap()));
    }

    #[test]
    fn test_parse_not_found_and_null_local() {
        let body = r#"{"status": "not_found", "error": "Device not found or expired"}"#;
        let response: ApiResponse = serde_json::from_str(body).unwrap();
        assert!(response.is_not_found());

        let body = r#"{"status": "ok", "device_info": {"public_addr": {"ip": "10.0.0.1", "port": 1}, "local_addr": null}}"#;
        let response: ApiResponse = serde_json::from_str(body).unwrap();
        let info: PeerAddressInfo = response.device_info.unwrap().into();
        assert!(info.local_addr.is_none());
    }

    #[test]
    fn test_parse_connect_requests() {
        let requester = DeviceId::from_bytes([0x11; 16]);
        let body = format!(
            r#"{{"status": "ok", "requests": [
                {{"requester_id": "{requester}", "requester_info": {{"public_addr": {{"ip": "1.2.3.4", "port": 9}}}}, "timestamp": 17.5}},
                {{"requester_id": "zz", "requester_info": {{}}, "timestamp": 18.0}}
            ]}}"#
        );
        let response: ApiResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(response.requests.len(), 2);
        assert_eq!(response.requests[0].requester_id.parse::<DeviceId>().unwrap(), requester);
        assert!(response.requests[1].requester_id.parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let client = HttpRendezvousClient::new("http://example.test:8080/").unwrap();
        assert_eq!(client.endpoint(), "http://example.test:8080/api");
    }
}

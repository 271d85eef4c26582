// Copyright (c) 2024 Botho Foundation

//! HTTP rendezvous client against an in-process server.

mod common;

use common::*;
use ghostline::{
    identity::DeviceId,
    network::{
        spawn_heartbeat, ConnectTarget, HttpRendezvousClient, PeerAddressInfo, RendezvousClient, RendezvousError,
    },
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

fn device(byte: u8) -> DeviceId {
    DeviceId::from_bytes([byte; 16])
}

fn info(public: &str, local: &str) -> PeerAddressInfo {
    PeerAddressInfo::new(Some(public.parse().unwrap()), Some(local.parse().unwrap()))
}

#[tokio::test]
async fn test_register_lookup_unregister() {
    let server = TestRendezvousServer::start().await;
    let client = HttpRendezvousClient::new(&server.url).unwrap();
    assert_eq!(client.endpoint(), format!("{}/api", server.url));

    let alice = device(1);
    let addresses = info("203.0.113.7:7100", "192.168.1.7:7100");
    client.register(alice, addresses).await.unwrap();

    let body = server.log.lock()[0].clone();
    assert_eq!(body["action"], "register");
    assert_eq!(body["device_id"], alice.to_string());
    assert_eq!(body["public_addr"]["ip"], "203.0.113.7");
    assert_eq!(body["public_addr"]["port"], 7100);
    assert_eq!(body["local_addr"]["ip"], "192.168.1.7");

    assert_eq!(client.lookup(alice).await.unwrap(), Some(addresses));
    assert_eq!(client.lookup(device(2)).await.unwrap(), None);

    client.heartbeat(alice).await.unwrap();
    client.unregister(alice).await.unwrap();
    assert!(matches!(client.heartbeat(alice).await, Err(RendezvousError::NotRegistered)));
    assert_eq!(client.lookup(alice).await.unwrap(), None);
}

#[tokio::test]
async fn test_connect_request_flow() {
    let server = TestRendezvousServer::start().await;
    let client = HttpRendezvousClient::new(&server.url).unwrap();
    let (alice, bob) = (device(1), device(2));
    let alice_info = info("203.0.113.7:7100", "192.168.1.7:7100");
    let bob_info = info("198.51.100.3:7200", "10.0.0.3:7200");
    client.register(alice, alice_info).await.unwrap();
    client.register(bob, bob_info).await.unwrap();

    assert_eq!(client.request_connect(alice, bob).await.unwrap(), Some(bob_info));
    assert_eq!(client.request_connect(alice, device(9)).await.unwrap(), None);

    let pending = client.pending_connect_requests(bob).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].requester, alice);
    assert_eq!(pending[0].info, alice_info);
    assert!(pending[0].timestamp > 0.0);

    client.clear_connect_request(bob, alice).await.unwrap();
    assert!(client.pending_connect_requests(bob).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_heartbeat_reregisters_after_expiry() {
    let server = TestRendezvousServer::start().await;
    let client: Arc<dyn RendezvousClient> = Arc::new(HttpRendezvousClient::new(&server.url).unwrap());
    let alice = device(1);
    let addresses = info("203.0.113.7:7100", "192.168.1.7:7100");
    client.register(alice, addresses).await.unwrap();

    let cancel = CancellationToken::new();
    let heartbeat = spawn_heartbeat(client.clone(), alice, addresses, Duration::from_millis(50), cancel.clone());

    server.expire(&alice.to_string());
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !server.is_registered(&alice.to_string()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("heartbeat never re-registered");

    cancel.cancel();
    heartbeat.await.unwrap();
    assert!(!server.is_registered(&alice.to_string()));
    let actions = server.actions();
    assert!(actions.contains(&"heartbeat".to_string()));
    assert_eq!(actions.last().map(String::as_str), Some("unregister"));
}

#[tokio::test]
async fn test_unreachable_service_is_an_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = HttpRendezvousClient::with_timeout(&url, Duration::from_secs(2)).unwrap();
    assert!(matches!(client.lookup(device(1)).await, Err(RendezvousError::Http(_))));
}

#[tokio::test]
async fn test_messengers_meet_through_rendezvous() {
    let server = TestRendezvousServer::start().await;
    let client = || -> Option<Arc<dyn RendezvousClient>> { Some(Arc::new(HttpRendezvousClient::new(&server.url).unwrap())) };

    let config = messenger_config(quiet_obfuscation());
    let alice = start_messenger_with(config.clone(), client()).await;
    let bob = start_messenger_with(config, client()).await;
    assert!(alice.is_registered() && bob.is_registered());
    alice.add_peer(bob.device_identity(), None, None);
    bob.add_peer(alice.device_identity(), None, None);
    let mut bob_inbox = inbox(&bob);

    // No address hint: the send resolves bob through the service
    alice.send_message(&bob.device_id(), b"found you").await.unwrap();
    let message = recv(&mut bob_inbox).await;
    assert_eq!(message.plaintext, b"found you");
    assert_eq!(message.from, alice.device_id());
    assert!(server.actions().contains(&"lookup".to_string()));

    alice.disconnect(&bob.device_id());
    let via = alice
        .connect(ConnectTarget::Lookup(bob.device_id()))
        .await
        .unwrap()
        .expect("disconnected above");
    assert_eq!(Some(via.addr), bob.advertised_addresses().local_addr);

    alice.shutdown().await;
    bob.shutdown().await;
    assert!(!server.is_registered(&alice.device_id().to_string()));
}

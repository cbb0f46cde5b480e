use sidecar::Proxy;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn start_proxy(target: String) -> (SocketAddr, CancellationToken) {
    let proxy = Proxy::bind("127.0.0.1:0".parse().unwrap(), target)
        .await
        .unwrap();
    let addr = proxy.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(proxy.run(shutdown.clone()));
    (addr, shutdown)
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match timeout(WAIT, stream.read(&mut buf)).await.unwrap() {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected close, read {n} bytes"),
    }
}

#[tokio::test]
async fn relays_bytes_both_ways_unmodified() {
    let instance = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (proxy_addr, shutdown) = start_proxy(instance.local_addr().unwrap().to_string()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut upstream, _) = timeout(WAIT, instance.accept()).await.unwrap().unwrap();

    let request: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    client.write_all(&request).await.unwrap();
    assert_eq!(read_exact(&mut upstream, request.len()).await, request);

    upstream.write_all(b"\x00pong\r\n").await.unwrap();
    assert_eq!(read_exact(&mut client, 7).await, b"\x00pong\r\n");

    shutdown.cancel();
}

#[tokio::test]
async fn half_closed_request_still_gets_reply() {
    let instance = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (proxy_addr, shutdown) = start_proxy(instance.local_addr().unwrap().to_string()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut upstream, _) = timeout(WAIT, instance.accept()).await.unwrap().unwrap();

    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();

    let mut request = Vec::new();
    timeout(WAIT, upstream.read_to_end(&mut request))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request, b"ping");

    upstream.write_all(b"pong").await.unwrap();
    drop(upstream);

    let mut reply = Vec::new();
    timeout(WAIT, client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"pong");
    shutdown.cancel();
}

#[tokio::test]
async fn instance_close_closes_client() {
    let instance = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (proxy_addr, shutdown) = start_proxy(instance.local_addr().unwrap().to_string()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let (upstream, _) = timeout(WAIT, instance.accept()).await.unwrap().unwrap();
    drop(upstream);

    assert_closed(&mut client).await;
    shutdown.cancel();
}

#[tokio::test]
async fn client_close_closes_instance_side() {
    let instance = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (proxy_addr, shutdown) = start_proxy(instance.local_addr().unwrap().to_string()).await;

    let client = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut upstream, _) = timeout(WAIT, instance.accept()).await.unwrap().unwrap();
    drop(client);

    assert_closed(&mut upstream).await;
    shutdown.cancel();
}

#[tokio::test]
async fn failed_dial_closes_inbound_and_keeps_accepting() {
    // reserve a port, then free it so nothing listens there
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let (proxy_addr, shutdown) = start_proxy(dead_addr.to_string()).await;

    for _ in 0..3 {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let _ = client.write_all(b"hello").await;
        assert_closed(&mut client).await;
    }
    shutdown.cancel();
}

#[tokio::test]
async fn connections_are_independent() {
    let instance = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (proxy_addr, shutdown) = start_proxy(instance.local_addr().unwrap().to_string()).await;

    let mut first = TcpStream::connect(proxy_addr).await.unwrap();
    let (first_up, _) = timeout(WAIT, instance.accept()).await.unwrap().unwrap();
    let mut second = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut second_up, _) = timeout(WAIT, instance.accept()).await.unwrap().unwrap();

    drop(first_up);
    assert_closed(&mut first).await;

    second.write_all(b"still here").await.unwrap();
    assert_eq!(read_exact(&mut second_up, 10).await, b"still here");
    shutdown.cancel();
}

#[tokio::test]
async fn bind_conflict_is_an_error() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let result = Proxy::bind(taken.local_addr().unwrap(), "127.0.0.1:1".to_string()).await;
    assert!(result.is_err());
}

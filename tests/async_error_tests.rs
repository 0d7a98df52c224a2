use miniperf::protocol::{
    encode_control_header, read_message, write_message, ControlHeader, ControlMessage, ExperimentParams, MessageType,
    MAX_PAYLOAD_LEN,
};
use miniperf::{Client, Config, Error, Server};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// A header cut short by a disconnect is a disconnect, not a crash
#[tokio::test]
async fn test_truncated_header_is_disconnect() {
    let (mut a, mut b) = tokio::io::duplex(256);
    let header = encode_control_header(MessageType::Sync, 8, 1, 0);
    a.write_all(&header[..10]).await.unwrap();
    drop(a);

    let err = read_message(&mut b).await.unwrap_err();
    assert!(err.is_disconnect(), "unexpected error {:?}", err);
}

/// An absurd payload length is rejected before anything is allocated
#[tokio::test]
async fn test_oversized_payload_rejected() {
    let (mut a, mut b) = tokio::io::duplex(256);
    let header = encode_control_header(MessageType::Stats, u32::MAX, 0, 0);
    a.write_all(&header).await.unwrap();

    let err = read_message(&mut b).await.unwrap_err();
    assert!(matches!(err, Error::Format(_)));

    let (mut a, mut b) = tokio::io::duplex(256);
    let header = encode_control_header(MessageType::Stats, MAX_PAYLOAD_LEN + 1, 0, 0);
    a.write_all(&header).await.unwrap();
    assert!(read_message(&mut b).await.is_err());
}

/// An empty stream yields EOF on the first header
#[tokio::test]
async fn test_empty_stream() {
    let (a, mut b) = tokio::io::duplex(64);
    drop(a);
    let err = read_message(&mut b).await.unwrap_err();
    assert!(err.is_disconnect());
}

/// The reader stays in sync across an unknown message with a payload
#[tokio::test]
async fn test_unknown_message_is_skipped_cleanly() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    let unknown = ControlMessage::new(MessageType::Unknown(200), vec![9; 40], 0, 0);
    write_message(&mut a, &unknown).await.unwrap();
    write_message(&mut a, &ControlMessage::stop()).await.unwrap();

    let first = read_message(&mut b).await.unwrap();
    assert_eq!(first.msg_type(), MessageType::Unknown(200));
    assert_eq!(first.payload.len(), 40);
    assert_eq!(read_message(&mut b).await.unwrap().msg_type(), MessageType::StopExp);
    assert_eq!(ControlHeader::SIZE, 23);
}

/// Connecting to a closed port is a connection error
#[tokio::test]
async fn test_client_connect_failure() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = Client::new(Config::client("127.0.0.1".to_string(), port)).unwrap();
    let result = timeout(Duration::from_secs(5), client.run()).await.unwrap();
    assert!(matches!(result, Err(Error::Connection(_))));
}

/// The server refuses to start when its port is taken
#[tokio::test]
async fn test_server_bind_failure() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let server = Server::new(Config::server(port).with_address("127.0.0.1"));
    let result = timeout(Duration::from_secs(2), server.run()).await.unwrap();
    assert!(matches!(result, Err(Error::Io(_))));
}

/// Invalid configuration is rejected before any socket is opened
#[tokio::test]
async fn test_server_invalid_config() {
    let server = Server::new(Config::server(5201).with_packet_size(100_000));
    assert!(matches!(server.run().await, Err(Error::Config(_))));
}

/// A client that leaves before START ends the session quietly
#[tokio::test]
async fn test_client_leaves_before_start() {
    let port = 25231;
    let server = Server::new(Config::server(port).with_address("127.0.0.1"));
    let handle = tokio::spawn(async move { server.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_message(&mut stream, &ControlMessage::sync(1)).await.unwrap();
    let resp = read_message(&mut stream).await.unwrap();
    assert_eq!(resp.msg_type(), MessageType::SyncResp);
    drop(stream);

    let result = timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
    assert!(result.unwrap().is_none());
}

/// Bad experiment parameters from the peer are surfaced as errors
#[tokio::test]
async fn test_server_rejects_bad_params() {
    let port = 25241;
    let server = Server::new(Config::server(port).with_address("127.0.0.1"));
    let handle = tokio::spawn(async move { server.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut params = ExperimentParams::from_config(&Config::client("127.0.0.1".to_string(), port));
    params.packet_size = 9000;
    write_message(&mut stream, &ControlMessage::start(&params, 0).unwrap())
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Config(_))));

    // The server acknowledged, then told the client to stop
    let mut seen = Vec::new();
    while let Ok(msg) = read_message(&mut stream).await {
        seen.push(msg.msg_type());
    }
    assert!(seen.contains(&MessageType::StopExp), "saw {:?}", seen);
}

use miniperf::measurements::ExperimentStatistics;
use miniperf::protocol::ExperimentParams;
use miniperf::receiver::{UdpReceiver, RECV_POLL_INTERVAL};
use miniperf::sender::UdpSender;
use miniperf::{Client, Config, Mode, RunFlag, Server};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

// Each end-to-end test uses its own port pair so they can run in parallel.

#[test]
fn test_config_builder() {
    let config = Config::client("192.168.1.100".to_string(), 5201)
        .with_duration(Duration::from_secs(30))
        .with_bandwidth(100_000_000)
        .with_packet_size(1024)
        .with_streams(4)
        .with_measure_delay(true)
        .with_json(true);

    assert_eq!(config.mode, Mode::Client);
    assert_eq!(config.port, 5201);
    assert_eq!(config.udp_port().unwrap(), 5202);
    assert_eq!(config.duration, Some(Duration::from_secs(30)));
    assert_eq!(config.bandwidth, 100_000_000);
    assert_eq!(config.packet_size, 1024);
    assert_eq!(config.streams, 4);
    assert!(config.measure_delay);
    assert!(config.json);
    assert!(config.validate().is_ok());
}

#[test]
fn test_sequence_accounting() {
    let mut stats = ExperimentStatistics::new();
    for (i, seq) in [0u32, 1, 2, 5, 6].into_iter().enumerate() {
        stats.record_packet(seq, 100, i as u64 * 1_000);
    }
    assert_eq!(stats.lost_packets, 3);
    assert_eq!(stats.expected_seq, 7);

    let mut stats = ExperimentStatistics::new();
    for (i, seq) in [0u32, 1, 1, 2].into_iter().enumerate() {
        stats.record_packet(seq, 100, i as u64 * 1_000);
    }
    assert_eq!(stats.out_of_order, 1);
    assert_eq!(stats.lost_packets, 0);
}

#[tokio::test]
async fn test_sender_pacing_rate() {
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(receiver.local_addr().unwrap()).await.unwrap();

    // 2 Mbit/s of 500 byte datagrams is 500 packets per second
    let config = Config::client("127.0.0.1".to_string(), 5201)
        .with_packet_size(500)
        .with_bandwidth(2_000_000)
        .with_duration(Duration::from_secs(1));

    let summary = UdpSender::new(Arc::new(socket), &config)
        .run(&RunFlag::new())
        .await
        .unwrap();

    let expected = summary.elapsed_secs * 2_000_000.0 / (8.0 * 500.0);
    let error = (summary.packets_sent as f64 - expected).abs() / expected;
    assert!(
        error < 0.1,
        "sent {} packets in {:.3}s, expected about {:.0}",
        summary.packets_sent,
        summary.elapsed_secs,
        expected
    );
}

#[tokio::test]
async fn test_receiver_exits_after_flag_cleared() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let params = ExperimentParams::from_config(&Config::client("127.0.0.1".to_string(), 5201));
    let receiver = UdpReceiver::new(Arc::new(socket), &params, 0);

    let flag = RunFlag::new();
    let handle = {
        let flag = flag.clone();
        tokio::spawn(async move { receiver.run(&flag).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped = Instant::now();
    flag.stop();

    tokio::time::timeout(RECV_POLL_INTERVAL * 4, handle)
        .await
        .expect("receiver did not notice the cleared flag")
        .unwrap()
        .unwrap();
    assert!(stopped.elapsed() < RECV_POLL_INTERVAL * 4);
}

#[tokio::test]
async fn test_server_stops_before_client() {
    let server = Server::new(Config::server(25221).with_address("127.0.0.1"));
    let flag = server.run_flag();
    let handle = tokio::spawn(async move { server.run().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    flag.stop();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("server should stop")
        .unwrap();
    assert!(result.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_bounded_run() {
    let port = 25201;
    let server = Server::new(
        Config::server(port)
            .with_address("127.0.0.1")
            .with_json(true),
    );
    let server_task = tokio::spawn(async move { server.run().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // 4 Mbit/s of 1000 byte datagrams for one second is about 500 packets
    let config = Config::client("127.0.0.1".to_string(), port)
        .with_packet_size(1000)
        .with_bandwidth(4_000_000)
        .with_duration(Duration::from_secs(1))
        .with_json(true);
    let summary = Client::new(config).unwrap().run().await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server should finish")
        .unwrap()
        .unwrap()
        .expect("server should report");

    let sent = summary.sender.packets_sent;
    assert!((400..=600).contains(&sent), "sent {}", sent);
    assert!(
        report.packets_received as f64 >= sent as f64 * 0.95,
        "received {} of {}",
        report.packets_received,
        sent
    );
    assert!(report.lost_percent < 5.0, "lost {:.2}%", report.lost_percent);
    assert_eq!(report.corrupt_packets, 0);

    let expected_bps = 4_000_000.0;
    assert!(
        (report.throughput_bps - expected_bps).abs() / expected_bps < 0.25,
        "throughput {:.0} bit/s",
        report.throughput_bps
    );

    let echoed = summary.server_report.expect("client should receive server stats");
    assert_eq!(echoed.packets_received, report.packets_received);
    assert!(summary.clock_synced);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_client_stop() {
    let port = 25211;
    let server = Server::new(
        Config::server(port)
            .with_address("127.0.0.1")
            .with_json(true),
    );
    let server_task = tokio::spawn(async move { server.run().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let config = Config::client("127.0.0.1".to_string(), port)
        .with_packet_size(200)
        .with_bandwidth(1_600_000) // 1000 pkt/s
        .with_measure_delay(true)
        .with_json(true);
    let client = Client::new(config).unwrap();
    let flag = client.run_flag();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        flag.stop();
    });

    let summary = tokio::time::timeout(Duration::from_secs(10), client.run())
        .await
        .expect("client should stop")
        .unwrap();
    assert!(summary.sender.packets_sent > 100);

    let report = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server should finish")
        .unwrap()
        .unwrap()
        .expect("server should report");
    assert!(report.packets_received > 100);
    assert!(report.delay.is_some());
    assert!(summary.server_report.is_some());
}

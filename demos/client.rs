use miniperf::{Client, Config};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("Connecting to miniperf server at 127.0.0.1:5201...");

    let config = Config::client("127.0.0.1".to_string(), 5201)
        .with_bandwidth(10_000_000)
        .with_packet_size(1200)
        .with_duration(Duration::from_secs(5))
        .with_measure_delay(true);

    let summary = Client::new(config)?.run().await?;

    println!(
        "\nSent {} datagrams at {:.2} Mbps",
        summary.sender.packets_sent,
        summary.sender.bits_per_second() / 1_000_000.0
    );
    if let Some(report) = summary.server_report {
        println!("Server saw {:.2}% loss, jitter {:.3} ms", report.lost_percent, report.jitter_mean_ms);
    }

    Ok(())
}

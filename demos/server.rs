use miniperf::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("Starting miniperf server on port 5201 (data on 5202)...");

    let server = Server::new(Config::server(5201));
    match server.run().await? {
        Some(report) => println!(
            "\nReceived {} datagrams, {:.2}% lost",
            report.packets_received, report.lost_percent
        ),
        None => println!("\nSession ended before an experiment ran"),
    }

    Ok(())
}

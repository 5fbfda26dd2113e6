// MIT License

//! Connect to a panel (or the simulator) and print every decoded event,
//! plus a JSON snapshot of the device model every ten seconds.
//!
//! Usage: `cargo run --example monitor -- <host> [port]`

use std::time::Duration;

use telenot_gms::{Session, SessionConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().as_deref().unwrap_or("8234").parse()?;

    let config = SessionConfig::builder(host).port(port).build();
    let session = Session::connect(config).await?;

    let mut events = session.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("event: {event:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("lagged, {n} events dropped");
                }
                Err(_) => break,
            }
        }
    });

    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = session.snapshot().await;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
}

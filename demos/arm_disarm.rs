// MIT License

//! Arm area 1 away, wait a moment, then disarm it again.
//!
//! Usage: `cargo run --example arm_disarm -- <host> [port]`

use std::time::Duration;

use telenot_gms::{ArmMode, Session, SessionConfig};

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

    let outcome = session.arm(1, ArmMode::Away).await?;
    println!("arm area 1 away: {outcome:?}");

    tokio::time::sleep(Duration::from_secs(5)).await;

    let outcome = session.disarm(1).await?;
    println!("disarm area 1: {outcome:?}");

    let snapshot = session.snapshot().await;
    for area in &snapshot.areas {
        println!("{}: {:?}", area.label, area.armed_state);
    }

    session.disconnect().await;
    Ok(())
}

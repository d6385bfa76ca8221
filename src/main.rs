mod cli;

use anyhow::{anyhow, bail, Context, Result};
use cli::{Cli, Commands};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use synergy::channel::Reply;
use synergy::network::{self, DEFAULT_BULK_PORT, DEFAULT_CONTROL_PORT};
use synergy::protocol::{to_data, Color, ColorChange, ColorChangeAck, ErrorCode, ErrorPayload};
use synergy::{
    Action, Config, Envelope, LinkState, Negotiation, OfferDecision, Role, Session, SessionEvent,
    TransferDescriptor, TransferEngine, TransferIo, TransferResult,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let level = if cli.verbose { "synergy=debug" } else { "synergy=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let config = match &cli.config {
        Some(path) => Config::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    let port = cli.port.unwrap_or(DEFAULT_CONTROL_PORT);

    match cli.command {
        Commands::Serve { bulk_port, output } => serve(config, port, bulk_port, output).await,
        Commands::Color { host, color } => send_color(config, &host, port, color).await,
        Commands::Send { host, path } => send_file(config, &host, port, &path).await,
    }
}

async fn serve(config: Config, port: u16, bulk_port: Option<u16>, output: PathBuf) -> Result<()> {
    println!("⚡ Synergy - Desktop");
    println!("═══════════════════════════════════════");

    let control = Arc::new(network::bind(Some(port), DEFAULT_CONTROL_PORT).await?);
    let bulk = network::bind(bulk_port, DEFAULT_BULK_PORT).await?;
    let bulk_port = bulk.local_addr()?.port();
    tokio::fs::create_dir_all(&output).await?;

    let session = Session::open(network::tcp_acceptor(control), Role::Desktop, config.clone())?;
    session.on_request(Action::ColorChange, show_color);

    let engine = TransferEngine::new(config)?;
    let mut offers = engine.accept_offers(&session, move |offer| {
        println!("Offer: {} ({})", offer.file_name, format_bytes(offer.total_size));
        OfferDecision::Accept { bulk_port }
    });

    println!("Waiting for a phone on port {} (files on {})", port, bulk_port);
    let mut events = session.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(descriptor) = offers.recv() => {
                if let Err(e) = receive_file(&engine, &bulk, descriptor, &output).await {
                    eprintln!("✗ {:#}", e);
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Link { to, .. }) => {
                    println!("Link {}", to);
                    if matches!(to, LinkState::Disconnected | LinkState::Error) {
                        session.reconnect()?;
                    }
                }
                Ok(SessionEvent::Notification(envelope)) => {
                    info!(action = %envelope.action, "unhandled notification");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!("dropped {} session events", missed),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => break,
        }
    }

    session.close().await;
    Ok(())
}

fn show_color(envelope: &Envelope) -> Option<Reply> {
    let change: ColorChange = match envelope.payload() {
        Ok(change) => change,
        Err(e) => return Some(Reply::Err(ErrorPayload::new(ErrorCode::E007, e.to_string()))),
    };
    println!("● Showing {}", change.color);
    let ack = ColorChangeAck {
        success: true,
        current_color: change.color,
    };
    to_data(&ack).ok().map(Reply::Ok)
}

async fn receive_file(
    engine: &TransferEngine,
    bulk: &TcpListener,
    descriptor: TransferDescriptor,
    output: &Path,
) -> Result<()> {
    // Only the last path component of a peer-supplied name is trusted.
    let name = Path::new(&descriptor.file_name)
        .file_name()
        .ok_or_else(|| anyhow!("refusing file name {:?}", descriptor.file_name))?
        .to_owned();
    let path = output.join(name);

    let permit = engine.admit(descriptor)?;
    let wait = engine.config().handshake_timeout;
    let (stream, peer) = tokio::time::timeout(wait, network::accept(bulk))
        .await
        .map_err(|_| anyhow!("sender did not connect within {:?}", wait))??;
    info!("Bulk link from {}", peer);

    let file = tokio::fs::File::create(&path).await?;
    let bar = progress_bar(permit.descriptor());
    let result = engine
        .run_transfer(permit, stream, TransferIo::sink(file), |p| bar.set_position(p.bytes_done))
        .await;

    if !result.success {
        let _ = tokio::fs::remove_file(&path).await;
    }
    finish(&bar, &result)?;
    println!("File saved to: {}", path.display());
    Ok(())
}

async fn connect(config: Config, host: &str, port: u16) -> Result<Session> {
    let session = Session::open(network::tcp_connector(host, port), Role::Mobile, config)?;
    session
        .wait_for_link(LinkState::Connected, CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("connecting to {}:{}", host, port))?;
    println!("✓ Connected to {}:{}", host, port);
    Ok(session)
}

async fn send_color(config: Config, host: &str, port: u16, color: Color) -> Result<()> {
    let session = connect(config, host, port).await?;
    let timeout = session.config().control_message_timeout;
    let reply = session.request(Envelope::color_change(color, Role::Mobile)?, timeout).await;
    session.close().await;

    let ack: ColorChangeAck = reply?.payload()?;
    if !ack.success {
        bail!("desktop refused, still showing {}", ack.current_color);
    }
    println!("✓ Desktop shows {}", ack.current_color);
    Ok(())
}

async fn send_file(config: Config, host: &str, port: u16, path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if metadata.is_dir() {
        bail!("{} is a directory", path.display());
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?;

    println!("⚡ Synergy - Send File");
    println!("═══════════════════════════════════════");
    println!("File: {} ({})", name, format_bytes(metadata.len()));

    let session = connect(config.clone(), host, port).await?;
    let engine = TransferEngine::new(config)?;
    let mut descriptor = engine.outbound(name, metadata.len());

    let outcome = match engine.request_transfer(&session, &mut descriptor).await {
        Ok(Negotiation::Accepted { bulk_port }) => {
            transfer(&engine, descriptor, host, bulk_port, path).await
        }
        Ok(Negotiation::Rejected { reason }) => Err(anyhow!("desktop declined: {}", reason)),
        Err(e) => Err(e.into()),
    };
    session.close().await;
    outcome
}

async fn transfer(
    engine: &TransferEngine,
    descriptor: TransferDescriptor,
    host: &str,
    bulk_port: u16,
    path: &Path,
) -> Result<()> {
    let permit = engine.admit(descriptor)?;
    let stream = network::connect(host, bulk_port).await?;
    let file = tokio::fs::File::open(path).await?;

    let bar = progress_bar(permit.descriptor());
    let result = engine
        .run_transfer(permit, stream, TransferIo::source(file), |p| bar.set_position(p.bytes_done))
        .await;
    finish(&bar, &result)
}

fn progress_bar(descriptor: &TransferDescriptor) -> ProgressBar {
    let bar = ProgressBar::new(descriptor.total_size);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    bar.set_message(descriptor.file_name.clone());
    bar
}

fn finish(bar: &ProgressBar, result: &TransferResult) -> Result<()> {
    if !result.success {
        bar.abandon();
        let kind = result
            .error
            .map(|k| k.to_string())
            .unwrap_or_else(|| "failed".to_string());
        bail!(
            "transfer {} failed ({}): {}",
            result.transfer_id,
            kind,
            result.message.as_deref().unwrap_or("no details")
        );
    }
    bar.finish();
    println!(
        "✓ Transfer complete: {} in {:.1}s @ {}/s{}",
        format_bytes(result.bytes_transferred),
        result.elapsed.as_secs_f64(),
        format_bytes(result.average_speed as u64),
        if result.verified { ", checksum verified" } else { "" }
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
    }

    #[test]
    fn test_show_color_acks_requested_color() {
        let envelope = Envelope::color_change(Color::Yellow, Role::Mobile).unwrap();
        match show_color(&envelope) {
            Some(Reply::Ok(data)) => {
                let ack: ColorChangeAck = serde_json::from_value(serde_json::Value::Object(data)).unwrap();
                assert!(ack.success);
                assert_eq!(ack.current_color, Color::Yellow);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
}

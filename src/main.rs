use anyhow::{Context, bail};
use chrono::Local;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use wasession::ClientConfig;
use wasession::binary::builder::NodeBuilder;
use wasession::pair::PrimaryDevice;
use wasession::store::MemoryDeviceStore;
use wasession::test_utils::{TestClient, is_passive_iq, pair_device_iq, pair_success_iq};
use wasession::types::events::Event;

/// Links a fresh device against an in-process server, then logs in with it.
///
/// Usage:
///   cargo run --features test-utils                              # default timings
///   cargo run --features test-utils -- --config session.json     # timings from a JSON file
///   cargo run --features test-utils -- --hosted                  # pair as a hosted account
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON file with client settings. Missing fields keep their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Have the simulated phone pair a hosted account.
    #[arg(long)]
    hosted: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ClientConfig::default(),
    };

    let session = TestClient::build(MemoryDeviceStore::new(), |b| b.with_config(config));
    let server = session.connect().await;

    server
        .inject(&pair_device_iq("pair-1", &["2@demo-ref-a", "2@demo-ref-b"]))
        .await;
    let Some(Event::Qr(qr)) = session.events.wait_for("Qr").await else {
        bail!("client never produced QR codes");
    };
    let Some(code) = qr.codes.first() else {
        bail!("QR event carried no codes");
    };
    info!("Scan this QR code: {code}");

    let mut phone = PrimaryDevice::new(1);
    if args.hosted {
        phone = phone.hosted();
    }
    let payload = phone.pairing_payload(code)?;
    server
        .inject(&pair_success_iq(
            "pair-2",
            payload,
            "15550001111:4@s.whatsapp.net",
            Some("987654321:4@lid"),
        ))
        .await;

    match session.events.wait_for("PairSuccess").await {
        Some(Event::PairSuccess(success)) => {
            info!("Paired as {} (LID {})", success.id, success.lid)
        }
        _ => bail!("pairing did not complete: {:?}", session.events.names()),
    }

    // The server restarts the stream once pairing is done.
    server
        .inject(&NodeBuilder::new("stream:error").attr("code", "515").build())
        .await;
    let server = session.factory.server(2).await;
    server.inject(&NodeBuilder::new("success").build()).await;
    if session.events.wait_for("Connected").await.is_none() {
        bail!("login after pairing failed");
    }
    if let Some(active) = server.next_node_matching(is_passive_iq).await {
        server.reply_result(&active).await;
    }
    info!("Logged in, state is {:?}", session.client.state());

    session.client.disconnect().await;
    info!("Disconnected cleanly");
    Ok(())
}

use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_engine::start_server;

/// websocket echo server
#[derive(Parser)]
struct Args {
    /// server host
    #[clap(long, default_value = "127.0.0.1")]
    host: String,
    /// server port
    #[clap(short, long, default_value = "9000")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), ()> {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");
    let args = Args::parse();
    let handle = start_server(
        |mut conn| async move {
            tracing::info!(addr = ?conn.remote_address(), "got connect");
            while let Some(msg) = conn.recv().await {
                if conn.send(msg).await.is_err() {
                    break;
                }
            }
            tracing::info!("one conn down");
        },
        &args.host,
        args.port,
    )
    .await
    .unwrap();
    tokio::signal::ctrl_c().await.unwrap();
    handle.stop().await;
    Ok(())
}

use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_engine::{FrameConfig, ServerBuilder};

/// echo server for the autobahn fuzzing client
#[derive(Parser)]
struct Args {
    /// server host
    #[clap(long, default_value = "127.0.0.1")]
    host: String,
    /// server port
    #[clap(short, long, default_value = "9002")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), ()> {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::INFO)
        .finish()
        .try_init()
        .expect("failed to init log");
    let args = Args::parse();
    let handle = ServerBuilder::new()
        .config(FrameConfig {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            ..Default::default()
        })
        .serve(
            |mut conn| async move {
                while let Some(msg) = conn.recv().await {
                    if conn.send(msg).await.is_err() {
                        break;
                    }
                }
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

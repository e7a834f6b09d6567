use std::io::Write;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_engine::ClientBuilder;

/// interactive websocket client, sends lines and prints replies
#[derive(Parser)]
struct Args {
    uri: String,
}

#[tokio::main]
async fn main() -> Result<(), ()> {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");
    let args = Args::parse();
    let mut client = ClientBuilder::new()
        .connect(args.uri.parse().unwrap())
        .await
        .unwrap();

    let mut input = String::new();
    loop {
        print!("[SEND] > ");
        std::io::stdout().flush().unwrap();
        std::io::stdin().read_line(&mut input).unwrap();
        if &input == "quit\n" {
            client.close(1000, "bye").await.ok();
            client.wait_closed().await;
            break;
        }
        client.send(input.trim_end()).await.unwrap();
        match client.recv().await {
            Some(msg) => {
                println!("[RECV] > {}", String::from_utf8_lossy(msg.as_data()));
                input.clear()
            }
            None => {
                tracing::warn!(code = ?client.close_code(), "connection ended");
                break;
            }
        }
    }
    Ok(())
}

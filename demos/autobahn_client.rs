use tracing::*;
use tracing_subscriber::util::SubscriberInitExt;
use ws_engine::{ClientBuilder, FrameConfig, Message, WsError};

const AGENT: &str = "ws-engine";

fn fuzzing_config() -> FrameConfig {
    FrameConfig {
        max_frame_size: 16 * 1024 * 1024,
        max_message_size: 64 * 1024 * 1024,
        ..Default::default()
    }
}

async fn get_case_count() -> Result<usize, WsError> {
    let mut client = ClientBuilder::new()
        .connect("ws://localhost:9002/getCaseCount".parse().unwrap())
        .await?;
    let msg = client.recv().await.expect("missing case count");
    client.wait_closed().await;
    match msg {
        Message::Text(text) => Ok(text.parse().unwrap()),
        _ => panic!("expected text case count"),
    }
}

async fn run_test(case: usize) -> Result<(), WsError> {
    info!("running test case {}", case);
    let uri = format!("ws://localhost:9002/runCase?case={case}&agent={AGENT}");
    let mut client = ClientBuilder::new()
        .config(fuzzing_config())
        .connect(uri.parse().unwrap())
        .await?;
    while let Some(msg) = client.recv().await {
        if client.send(msg).await.is_err() {
            break;
        }
    }
    client.wait_closed().await;
    Ok(())
}

async fn update_report() -> Result<(), WsError> {
    let uri = format!("ws://localhost:9002/updateReports?agent={AGENT}");
    let mut client = ClientBuilder::new().connect(uri.parse().unwrap()).await?;
    client.close(1000, "").await.ok();
    client.wait_closed().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), ()> {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::INFO)
        .finish()
        .try_init()
        .expect("failed to init log");
    let count = get_case_count().await.unwrap();
    info!("total case {}", count);
    for case in 1..=count {
        if let Err(e) = run_test(case).await {
            error!("case {} {}", case, e);
        }
    }
    update_report().await.unwrap();
    Ok(())
}

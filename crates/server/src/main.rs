#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chat_relay::run().await
}

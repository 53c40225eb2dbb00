#[tokio::main]
async fn main() -> eyre::Result<()> {
    dispatchq::run().start().await
}

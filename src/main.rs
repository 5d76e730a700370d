#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskflow_lib::run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let exit_code = swarm_client::run().await.unwrap_or_else(|err| {
        eprintln!("{err}");
        1
    });
    std::process::exit(exit_code);
}

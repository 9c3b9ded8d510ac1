use anyhow::Context;
use clap::Parser;
use cy_smtp::Opt;

mod logging;

async fn run(opt: Opt) -> anyhow::Result<()> {
    logging::init().context("setting up logging")?;
    cy_smtp::run(&opt).await?;
    tracing::info!("test email sent successfully");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = Opt::parse();
    if let Err(err) = run(opt).await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

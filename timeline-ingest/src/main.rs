use anyhow::Error;
use clap::Parser;
use envconfig::Envconfig;
use timeline_ingest::{
    cmd::Cli,
    config::Config,
    context::AppContext,
    error::{get_user_message, ToUserError},
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    // Logs go to stderr, stdout is for command output
    let log_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn run(cli: Cli) -> Result<(), Error> {
    let config = Config::init_from_env().user_error("Invalid configuration in environment")?;
    let context = AppContext::new(&config).await?;
    cli.run(&context).await
}

#[tokio::main]
async fn main() {
    setup_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => info!("Done"),
        Err(e) => {
            error!("Command failed: {:?}", e);
            eprintln!("Oops! {}", get_user_message(&e));
            std::process::exit(1);
        }
    }
}

use clap::Parser;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = hostctl::cli::Cli::parse();
    let code = match hostctl::app::run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{:#}", e);
            2
        }
    };
    std::process::exit(code);
}

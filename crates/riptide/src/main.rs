use clap::Parser;
use riptide::logging::setup_logger;
use riptide::{args, ClientOptions};

#[tokio::main]
async fn main() {
    setup_logger();

    let args = args::Arguments::parse();
    let options = ClientOptions::from_args(args);

    if let Err(error) = riptide::download(options).await {
        tracing::error!("{}", error);
        std::process::exit(error.exit_code());
    }
}

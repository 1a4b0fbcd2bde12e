use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = headfullctl::Cli::parse();
    headfullctl::init_tracing();
    if let Err(err) = headfullctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

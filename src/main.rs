// src/main.rs

use cmddispatch::{cli, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("cmddispatch error: {err:?}");
            std::process::exit(1);
        }
    }
}

/// Returns whether every command succeeded.
async fn run_main() -> anyhow::Result<bool> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    let summary = run(args).await?;
    summary.print();
    Ok(summary.all_succeeded())
}

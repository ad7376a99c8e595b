use clap::Parser;
use flowprobe::command::{run, Options};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Parse command line arguments
    let options = Options::parse();

    // Run main program
    run(options).await?;

    Ok(())
}

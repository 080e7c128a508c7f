use clap::Parser;
use image_relocator::cli::{Args, Runner};
use image_relocator::logging::Logger;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let runner = match Runner::new(args) {
        Ok(runner) => runner,
        Err(e) => {
            Logger::default().error(&e.to_string());
            std::process::exit(1);
        }
    };

    if let Err(e) = runner.run().await {
        runner.output().error(&e.to_string());
        std::process::exit(1);
    }
}

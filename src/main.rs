mod cli;

use anyhow::Result;
use clap::Parser;
use cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    light_detect::logging::init(cli.verbose);
    cli.run()
}

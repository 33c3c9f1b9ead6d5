use assetserve::args::Args;
use assetserve::logging::setup_logging;
use assetserve::start_server;
use clap::Parser;
use std::io;

fn main() -> io::Result<()> {
    let args = Args::parse();
    setup_logging();
    start_server(args)
}

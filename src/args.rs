use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    #[arg(short, long, default_value = ".")]
    pub serve_dir: PathBuf,

    /// Time allowed for reading one request head
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub read_timeout: Duration,

    /// Socket write timeout
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub write_timeout: Duration,

    /// How long a kept-alive connection may wait for its next request
    #[arg(long, default_value = "120s", value_parser = humantime::parse_duration)]
    pub idle_timeout: Duration,

    #[arg(short, long, default_value = "6", value_parser = clap::value_parser!(u32).range(0..=9))]
    pub gzip_level: u32,
}

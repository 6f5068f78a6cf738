//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;
use crate::mime::parse_mime_override;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(
    name = "upserve",
    version = VERSION_INFO,
    about = "Serve a directory over HTTP and accept multipart uploads"
)]
pub struct Args {
    #[arg(
        env = "UPSERVE_PORT",
        default_value_t = DEFAULT_PORT,
        help = "Port to listen on"
    )]
    pub port: u16,
    #[arg(
        short = 'b',
        long,
        env = "UPSERVE_BIND",
        default_value = DEFAULT_BIND,
        value_name = "ADDRESS",
        help = "Bind address [default: all interfaces]"
    )]
    pub bind: String,
    #[arg(
        short = 'd',
        long,
        env = "UPSERVE_ROOT",
        default_value = ".",
        help = "Directory to serve and upload into"
    )]
    pub root: String,
    #[arg(
        long = "mime-type",
        value_name = "EXT=TYPE",
        value_parser = parse_mime_override,
        help = "Extra extension to Content-Type mapping (repeatable)"
    )]
    pub mime_types: Vec<(String, String)>,
}

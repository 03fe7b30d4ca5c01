use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "A leech-oriented BitTorrent client")]
pub struct Arguments {
    /// Torrent file to download
    #[arg(value_name = "TORRENT_FILE")]
    pub file: PathBuf,
    /// Directory to place the downloaded payload in
    #[arg(short, long, value_name = "OUTPUT_DIR", default_value = "./downloads")]
    pub output_dir: PathBuf,
    /// Listen port advertised to trackers. The first free port in 6881-6889
    /// is used when omitted
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Maximum number of concurrently connected peers
    #[arg(short, long, default_value_t = 15)]
    pub max_peers: usize,
    /// Extra peers to dial besides the ones the trackers return
    #[arg(long = "peer", value_name = "IP:PORT")]
    pub peers: Vec<std::net::SocketAddr>,
}

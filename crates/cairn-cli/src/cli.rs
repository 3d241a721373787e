use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cairn",
    about = "Cairn: content-addressed distributed object storage",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// TOML node configuration
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(long, global = true)]
    pub listen: Option<SocketAddr>,

    /// Storage root, overriding the configuration
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Peer to connect at startup (repeatable)
    #[arg(long = "peer", global = true)]
    pub peers: Vec<SocketAddr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a storage node until interrupted
    Serve(ServeArgs),
    /// Upload a file under a name
    Put(PutArgs),
    /// Download a named object into a file
    Get(GetArgs),
    /// Find the node responsible for an identifier
    Lookup(LookupArgs),
    /// List identifiers stored on a node
    List(ListArgs),
    /// Print the identifiers the transform chain derives from text
    Id(IdArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Join the ring through the configured peers after startup
    #[arg(long)]
    pub join: bool,
}

#[derive(Args)]
pub struct PutArgs {
    /// Node to contact
    pub peer: SocketAddr,
    pub name: String,
    pub file: PathBuf,
    #[arg(long, default_value = "0")]
    pub offset: u64,
    /// Bytes to upload; 0 uploads to the end of the file
    #[arg(long, default_value = "0")]
    pub size: u64,
    /// Append to the stored object instead of writing at `offset`
    #[arg(long)]
    pub append: bool,
}

#[derive(Args)]
pub struct GetArgs {
    pub peer: SocketAddr,
    pub name: String,
    pub dest: PathBuf,
    #[arg(long, default_value = "0")]
    pub offset: u64,
    /// Bytes to download; 0 downloads to the end of the object
    #[arg(long, default_value = "0")]
    pub size: u64,
}

#[derive(Args)]
pub struct LookupArgs {
    pub peer: SocketAddr,
    /// Hex identifier
    pub id: String,
}

#[derive(Args)]
pub struct ListArgs {
    pub peer: SocketAddr,
}

#[derive(Args)]
pub struct IdArgs {
    pub text: String,
}

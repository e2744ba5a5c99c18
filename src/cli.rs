use camino::Utf8PathBuf;
use dedupstore::BlockId;

#[derive(clap::Parser)]
#[command(version, about = "Inspect and drive a deduplicating block store")]
pub struct Cli {
    /// Store configuration file (JSON).
    #[arg(short, long, global = true, conflicts_with = "disk")]
    pub config: Option<Utf8PathBuf>,
    /// Use a disk store rooted at this directory instead of a config file.
    #[arg(long, global = true)]
    pub disk: Option<Utf8PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// Store a file as the content of a block.
    Put(Put),
    /// Read a block, or a range of it.
    Get(Get),
    /// Delete a block.
    Rm {
        block_id: BlockId,
    },
    /// Report whether a block exists.
    Exists {
        block_id: BlockId,
    },
    /// List all blocks.
    Ls,
    /// Run the storage access probe.
    Check,
    /// Chunk files into blocks and print the block records.
    Pack(Pack),
}

#[derive(clap::Args)]
pub struct Put {
    pub block_id: BlockId,
    pub file: Utf8PathBuf,
    /// Write sequence number; the final version when omitted.
    #[arg(long)]
    pub block_version: Option<u32>,
}

#[derive(clap::Args)]
pub struct Get {
    pub block_id: BlockId,
    #[arg(long, default_value_t = 0)]
    pub offset: u64,
    /// Bytes to read; 0 reads to the end of the block.
    #[arg(long, default_value_t = 0)]
    pub length: u64,
    /// Node that produced the block, for reads of blocks still pending there.
    #[arg(long, default_value = "")]
    pub from: String,
    /// Write to a file instead of stdout.
    #[arg(short, long)]
    pub output: Option<Utf8PathBuf>,
}

#[derive(clap::Args)]
pub struct Pack {
    /// Fixed chunk size in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    pub chunk_size: usize,
    /// Upper bound on a block payload in bytes.
    #[arg(long, default_value_t = dedupstore::packer::DEFAULT_MAX_BLOCK_SIZE)]
    pub max_block_size: usize,
    /// Address of this node, recorded on the blocks.
    #[arg(long)]
    pub location: Option<String>,
    /// Files to pack.
    #[arg(required = true)]
    pub files: Vec<Utf8PathBuf>,
}

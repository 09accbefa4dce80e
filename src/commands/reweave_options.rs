use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(
    name = "reweave",
    about = "Deterministic record/replay of multithreaded targets, driven through gdb"
)]
pub struct ReweaveOptions {
    /// The gdb executable used as the execution substrate.
    #[structopt(long = "gdb", default_value = "gdb", parse(from_os_str))]
    pub gdb: PathBuf,

    #[structopt(subcommand)]
    pub cmd: ReweaveSubCommand,
}

#[derive(Clone, Debug, StructOpt)]
pub enum ReweaveSubCommand {
    /// Record the shared-variable interleaving of one run into a checkpoint
    /// log.
    #[structopt(name = "record")]
    Record {
        /// Target executable to record.
        #[structopt(parse(from_os_str))]
        target: PathBuf,

        /// Shared variable to watch; repeat for each.
        #[structopt(
            long = "shared-variable",
            short = "s",
            required = true,
            number_of_values = 1
        )]
        shared_variables: Vec<String>,

        /// Thread start-routine symbol; repeat for each.
        #[structopt(long = "start-routine", short = "r", number_of_values = 1)]
        start_routines: Vec<String>,

        /// Where to write the checkpoint log.
        #[structopt(
            long = "output",
            short = "o",
            default_value = "checkpoints.json",
            parse(from_os_str)
        )]
        output: PathBuf,
    },

    /// Re-execute a target, forcing the thread interleaving of a checkpoint
    /// log.
    #[structopt(name = "replay")]
    Replay {
        /// Target executable to replay; must be the binary that was
        /// recorded.
        #[structopt(parse(from_os_str))]
        target: PathBuf,

        /// Checkpoint log to replay.
        #[structopt(
            long = "checkpoints",
            short = "c",
            default_value = "checkpoints.json",
            parse(from_os_str)
        )]
        checkpoints: PathBuf,
    },
}

mod checkpoint;
mod code_addr;
mod commands;
mod error;
mod gdb;
mod session;
mod thread_tracker;

use commands::record_command::RecordCommand;
use commands::replay_command::ReplayCommand;
use commands::reweave_options::{ReweaveOptions, ReweaveSubCommand};
use commands::ReweaveCommand;
use log::error;
use structopt::StructOpt;

fn main() {
    pretty_env_logger::init();
    let options = ReweaveOptions::from_args();
    let mut command: Box<dyn ReweaveCommand> = match options.cmd {
        ReweaveSubCommand::Record { .. } => Box::new(RecordCommand::new(&options)),
        ReweaveSubCommand::Replay { .. } => Box::new(ReplayCommand::new(&options)),
    };
    if let Err(err) = command.run() {
        error!("{}", err);
        std::process::exit(1);
    }
}

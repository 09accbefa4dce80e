pub mod record_command;
pub mod replay_command;
pub mod reweave_options;

use crate::error::Result;

pub trait ReweaveCommand {
    fn run(&mut self) -> Result<()>;
}

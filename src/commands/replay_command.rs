use crate::checkpoint::CheckpointLog;
use crate::commands::reweave_options::{ReweaveOptions, ReweaveSubCommand};
use crate::commands::ReweaveCommand;
use crate::error::Result;
use crate::gdb::mi_session::GdbMiSession;
use crate::gdb::{DebuggerDriver, EventStream, ListenerRef};
use crate::session::replay_session::ReplaySession;
use log::info;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

pub struct ReplayCommand {
    gdb: PathBuf,
    target: PathBuf,
    checkpoints: PathBuf,
}

impl ReplayCommand {
    pub fn new(options: &ReweaveOptions) -> ReplayCommand {
        match options.cmd.clone() {
            ReweaveSubCommand::Replay {
                target,
                checkpoints,
            } => ReplayCommand {
                gdb: options.gdb.clone(),
                target,
                checkpoints,
            },
            _ => panic!("Unexpected ReweaveSubCommand variant. Not a `Replay` variant!"),
        }
    }
}

impl ReweaveCommand for ReplayCommand {
    fn run(&mut self) -> Result<()> {
        let log = CheckpointLog::load(&self.checkpoints)?;
        info!(
            "replaying {} checkpoint(s) against {}",
            log.checkpoints.len(),
            self.target.display()
        );
        let debugger = GdbMiSession::launch(&self.gdb, &self.target)?;
        let mut driver = DebuggerDriver::new(debugger);
        let session = Rc::new(RefCell::new(ReplaySession::new(log)?));
        for stream in [
            EventStream::Stop,
            EventStream::NewThread,
            EventStream::ThreadExited,
            EventStream::Exited,
        ] {
            driver.connect(stream, session.clone() as ListenerRef);
        }
        session.borrow_mut().start(&mut driver.gateway())?;
        driver.run()?;
        info!("replay reproduced the recorded interleaving");
        Ok(())
    }
}

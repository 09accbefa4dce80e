use crate::commands::reweave_options::{ReweaveOptions, ReweaveSubCommand};
use crate::commands::ReweaveCommand;
use crate::error::Result;
use crate::gdb::mi_session::GdbMiSession;
use crate::gdb::{DebuggerDriver, EventStream, ListenerRef};
use crate::session::record_session::RecordSession;
use log::info;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

pub struct RecordCommand {
    gdb: PathBuf,
    target: PathBuf,
    shared_variables: Vec<String>,
    start_routines: Vec<String>,
    output: PathBuf,
}

impl RecordCommand {
    pub fn new(options: &ReweaveOptions) -> RecordCommand {
        match options.cmd.clone() {
            ReweaveSubCommand::Record {
                target,
                shared_variables,
                start_routines,
                output,
            } => RecordCommand {
                gdb: options.gdb.clone(),
                target,
                shared_variables,
                start_routines,
                output,
            },
            _ => panic!("Unexpected ReweaveSubCommand variant. Not a `Record` variant!"),
        }
    }
}

impl ReweaveCommand for RecordCommand {
    fn run(&mut self) -> Result<()> {
        info!(
            "recording {} into {}",
            self.target.display(),
            self.output.display()
        );
        let debugger = GdbMiSession::launch(&self.gdb, &self.target)?;
        let mut driver = DebuggerDriver::new(debugger);
        let session = Rc::new(RefCell::new(RecordSession::new(
            self.shared_variables.clone(),
            self.start_routines.clone(),
            self.output.clone(),
        )));
        for stream in [
            EventStream::Stop,
            EventStream::NewThread,
            EventStream::ThreadExited,
            EventStream::Exited,
        ] {
            driver.connect(stream, session.clone() as ListenerRef);
        }
        session.borrow_mut().start(&mut driver.gateway())?;
        driver.run()
    }
}

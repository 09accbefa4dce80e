//! A scripted in-memory debugger for exercising the orchestrators through
//! the real event pump. The script is a sequence of events to deliver, each
//! optionally adjusting the world the immediate queries observe; every
//! command and breakpoint insertion is rendered to its CLI spelling so tests
//! can assert exact command traces.

use super::{
    BreakpointHandle, BreakpointKind, BreakpointNum, BreakpointSpec, Debugger, DebuggerEvent,
    GatewayError, GdbCommand, ThreadId, MAIN_THREAD,
};
use crate::code_addr::CodeAddr;
use std::collections::VecDeque;

pub struct Step {
    event: DebuggerEvent,
    live_threads: Option<Vec<ThreadId>>,
    caller_pc: Option<CodeAddr>,
}

impl Step {
    pub fn event(event: DebuggerEvent) -> Step {
        Step {
            event,
            live_threads: None,
            caller_pc: None,
        }
    }

    /// Live-thread set the debugger reports from this event onward.
    pub fn with_live(mut self, live: Vec<ThreadId>) -> Step {
        self.live_threads = Some(live);
        self
    }

    /// Answer for the next `caller_pc` query.
    pub fn with_caller_pc(mut self, pc: CodeAddr) -> Step {
        self.caller_pc = Some(pc);
        self
    }
}

pub struct ScriptedDebugger {
    script: VecDeque<Step>,
    issued: Vec<String>,
    breakpoints: Vec<BreakpointSpec>,
    live: Vec<ThreadId>,
    selected: ThreadId,
    last_pc: Option<CodeAddr>,
    caller_pcs: VecDeque<CodeAddr>,
    next_number: BreakpointNum,
    fail_watchpoints: bool,
    finished: bool,
}

impl ScriptedDebugger {
    pub fn new(script: Vec<Step>) -> ScriptedDebugger {
        ScriptedDebugger {
            script: script.into(),
            issued: Vec::new(),
            breakpoints: Vec::new(),
            live: vec![MAIN_THREAD],
            selected: MAIN_THREAD,
            last_pc: None,
            caller_pcs: VecDeque::new(),
            next_number: 1,
            fail_watchpoints: false,
            finished: false,
        }
    }

    /// Refuse access-watchpoint insertion, as a debugger out of hardware
    /// watchpoints would.
    pub fn fail_watchpoint_inserts(mut self) -> ScriptedDebugger {
        self.fail_watchpoints = true;
        self
    }

    /// Every command and breakpoint insertion, in issue order, rendered to
    /// its CLI spelling.
    pub fn issued(&self) -> &[String] {
        &self.issued
    }

    pub fn inserted_breakpoints(&self) -> &[BreakpointSpec] {
        &self.breakpoints
    }

    fn render_spec(spec: &BreakpointSpec) -> String {
        match spec.kind {
            BreakpointKind::AccessWatch => format!("awatch {}", spec.location),
            BreakpointKind::Code => {
                let mut line = String::from(if spec.temporary { "tbreak" } else { "break" });
                line.push_str(&format!(" {}", spec.location));
                if let Some(thread) = spec.thread {
                    line.push_str(&format!(" thread {}", thread));
                }
                line
            }
        }
    }
}

impl Debugger for ScriptedDebugger {
    fn execute(&mut self, command: &GdbCommand) -> Result<(), GatewayError> {
        assert!(!self.finished, "command issued after quit: {}", command);
        self.issued.push(command.to_string());
        match command {
            GdbCommand::SelectThread(thread) => self.selected = *thread,
            GdbCommand::Quit => self.finished = true,
            _ => {}
        }
        Ok(())
    }

    fn insert_breakpoint(
        &mut self,
        spec: &BreakpointSpec,
    ) -> Result<BreakpointHandle, GatewayError> {
        if self.fail_watchpoints && spec.kind == BreakpointKind::AccessWatch {
            return Err(GatewayError::Breakpoint {
                location: spec.location.to_string(),
                message: "too many hardware watchpoints".to_owned(),
            });
        }
        self.issued.push(Self::render_spec(spec));
        self.breakpoints.push(spec.clone());
        let number = self.next_number;
        self.next_number += 1;
        Ok(BreakpointHandle {
            number,
            spec: spec.clone(),
        })
    }

    fn live_threads(&mut self) -> Result<Vec<ThreadId>, GatewayError> {
        Ok(self.live.clone())
    }

    fn selected_thread(&mut self) -> Result<ThreadId, GatewayError> {
        Ok(self.selected)
    }

    fn current_pc(&mut self) -> Result<CodeAddr, GatewayError> {
        self.last_pc
            .ok_or_else(|| GatewayError::Protocol("no stop observed yet".to_owned()))
    }

    fn caller_pc(&mut self) -> Result<CodeAddr, GatewayError> {
        self.caller_pcs
            .pop_front()
            .ok_or_else(|| GatewayError::Protocol("no scripted caller pc".to_owned()))
    }

    fn wait_event(&mut self) -> Result<Option<DebuggerEvent>, GatewayError> {
        if self.finished {
            return Ok(None);
        }
        let step = match self.script.pop_front() {
            Some(step) => step,
            None => return Ok(None),
        };
        if let Some(live) = step.live_threads {
            self.live = live;
        }
        if let Some(pc) = step.caller_pc {
            self.caller_pcs.push_back(pc);
        }
        if let DebuggerEvent::Stop(stop) = &step.event {
            self.selected = stop.thread;
            self.last_pc = stop.pc;
        }
        Ok(Some(step.event))
    }
}

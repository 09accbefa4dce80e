//! Concrete gateway over a `gdb --interpreter=mi3` subprocess. Translates
//! MI output records into the gateway event vocabulary and keeps the live
//! thread set and the selected thread current from the notification stream,
//! so neither is queried while the target runs.

use super::mi::{self, MiRecord, MiResults, MiValue};
use super::{
    BreakpointHandle, BreakpointKind, BreakpointSpec, Debugger, DebuggerEvent, ExitedEvent,
    GatewayError, GdbCommand, NewThreadEvent, StopEvent, ThreadExitedEvent, ThreadId,
    MAIN_THREAD,
};
use crate::code_addr::CodeAddr;
use log::{trace, warn};
use std::collections::{BTreeSet, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub struct GdbMiSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pending: VecDeque<DebuggerEvent>,
    live: BTreeSet<ThreadId>,
    selected: ThreadId,
    gdb_exited: bool,
}

impl GdbMiSession {
    pub fn launch(gdb: &Path, target: &Path) -> Result<GdbMiSession, GatewayError> {
        let mut child = Command::new(gdb)
            .arg("--interpreter=mi3")
            .arg("--quiet")
            .arg("--nx")
            .arg(target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(GatewayError::Spawn)?;
        let stdin = child.stdin.take().expect("gdb stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("gdb stdout was piped"));
        let mut session = GdbMiSession {
            child,
            stdin,
            stdout,
            pending: VecDeque::new(),
            live: BTreeSet::new(),
            selected: MAIN_THREAD,
            gdb_exited: false,
        };
        session.consume_greeting()?;
        Ok(session)
    }

    /// Reads until the first prompt so symbol-loading chatter is not
    /// misattributed to the first command.
    fn consume_greeting(&mut self) -> Result<(), GatewayError> {
        loop {
            match self.read_record()? {
                None => return Err(GatewayError::Disconnected),
                Some(MiRecord::Prompt) => return Ok(()),
                Some(_) => continue,
            }
        }
    }

    fn read_record(&mut self) -> Result<Option<MiRecord>, GatewayError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .stdout
                .read_line(&mut line)
                .map_err(|e| GatewayError::Protocol(e.to_string()))?;
            if n == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            let record =
                mi::parse_record(&line).map_err(|e| GatewayError::Protocol(e.to_string()))?;
            return Ok(Some(record));
        }
    }

    /// Sends one MI command and reads records until its result record
    /// arrives. Async records seen along the way become pending events.
    fn send(&mut self, line: &str) -> Result<(String, MiResults), GatewayError> {
        trace!("mi <- {}", line);
        writeln!(self.stdin, "{}", line)
            .and_then(|_| self.stdin.flush())
            .map_err(|_| GatewayError::Disconnected)?;
        loop {
            match self.read_record()? {
                None => return Err(GatewayError::Disconnected),
                Some(MiRecord::Result { class, results }) => return Ok((class, results)),
                Some(MiRecord::Prompt) => continue,
                Some(MiRecord::Stream { text, .. }) => trace!("mi -> {}", text.trim_end()),
                Some(record) => {
                    if let Some(event) = self.translate(record) {
                        self.pending.push_back(event);
                    }
                }
            }
        }
    }

    fn command_result(
        &mut self,
        line: &str,
        accepted: &[&str],
    ) -> Result<MiResults, GatewayError> {
        let (class, results) = self.send(line)?;
        if class == "error" {
            let message = mi::find(&results, "msg")
                .and_then(MiValue::as_const)
                .unwrap_or("unknown error")
                .to_owned();
            return Err(GatewayError::Command {
                command: line.to_owned(),
                message,
            });
        }
        if !accepted.contains(&class.as_str()) {
            return Err(GatewayError::Protocol(format!(
                "unexpected result class `{}` for `{}`",
                class, line
            )));
        }
        Ok(results)
    }

    fn translate(&mut self, record: MiRecord) -> Option<DebuggerEvent> {
        match record {
            MiRecord::ExecAsync { class, results } if class == "stopped" => {
                self.translate_stopped(&results)
            }
            MiRecord::NotifyAsync { class, results } => match class.as_str() {
                "thread-created" => {
                    let id = thread_id(&results)?;
                    self.live.insert(id);
                    if id == MAIN_THREAD {
                        // The primary thread's birth is part of `run`, not a
                        // thread-creation syscall.
                        return None;
                    }
                    Some(DebuggerEvent::NewThread(NewThreadEvent {
                        inferior_thread: self.selected,
                    }))
                }
                "thread-exited" => {
                    let id = thread_id(&results)?;
                    self.live.remove(&id);
                    Some(DebuggerEvent::ThreadExited(ThreadExitedEvent { thread: id }))
                }
                "thread-selected" => {
                    if let Some(id) = thread_id(&results) {
                        self.selected = id;
                    }
                    None
                }
                _ => None,
            },
            _ => None,
        }
    }

    fn translate_stopped(&mut self, results: &MiResults) -> Option<DebuggerEvent> {
        let reason = mi::find(results, "reason").and_then(MiValue::as_const);
        if let Some(reason) = reason {
            if reason.starts_with("exited") {
                self.live.clear();
                // MI reports the inferior's exit code in octal.
                let exit_code = mi::find(results, "exit-code")
                    .and_then(MiValue::as_const)
                    .and_then(|s| i64::from_str_radix(s, 8).ok());
                return Some(DebuggerEvent::Exited(ExitedEvent { exit_code }));
            }
        }
        let thread = mi::find(results, "thread-id")
            .and_then(MiValue::as_const)
            .and_then(|s| s.parse::<ThreadId>().ok())
            .unwrap_or(self.selected);
        self.selected = thread;
        let pc = mi::find(results, "frame")
            .and_then(MiValue::as_tuple)
            .and_then(|frame| mi::find(frame, "addr"))
            .and_then(MiValue::as_const)
            .and_then(|s| s.parse::<CodeAddr>().ok());
        let breakpoint = stop_breakpoint_number(results, reason);
        Some(DebuggerEvent::Stop(StopEvent {
            thread,
            pc,
            breakpoint,
        }))
    }
}

fn frame_addr(frame: Option<&MiValue>) -> Option<CodeAddr> {
    frame
        .and_then(MiValue::as_tuple)
        .and_then(|f| mi::find(f, "addr"))
        .and_then(MiValue::as_const)
        .and_then(|s| s.parse().ok())
}

fn thread_id(results: &MiResults) -> Option<ThreadId> {
    mi::find(results, "id")
        .and_then(MiValue::as_const)
        .and_then(|s| s.parse::<ThreadId>().ok())
}

/// The breakpoint or watchpoint behind a stop, if any. Syscall catchpoints
/// report their number the same way ordinary breakpoints do.
fn stop_breakpoint_number(results: &MiResults, reason: Option<&str>) -> Option<u32> {
    if let Some(value) = mi::find(results, "bkptno").and_then(MiValue::as_const) {
        return value.parse().ok();
    }
    match reason {
        Some("watchpoint-trigger")
        | Some("access-watchpoint-trigger")
        | Some("read-watchpoint-trigger") => ["wpt", "hw-awpt", "hw-rwpt"]
            .iter()
            .find_map(|key| mi::find(results, key))
            .and_then(MiValue::as_tuple)
            .and_then(|wpt| mi::find(wpt, "number"))
            .and_then(MiValue::as_const)
            .and_then(|s| s.parse().ok()),
        _ => None,
    }
}

fn mi_line(command: &GdbCommand) -> String {
    fn on_off(value: bool) -> &'static str {
        if value {
            "on"
        } else {
            "off"
        }
    }
    match command {
        GdbCommand::Run => "-exec-run".to_owned(),
        GdbCommand::Continue => "-exec-continue".to_owned(),
        GdbCommand::Finish => "-exec-finish".to_owned(),
        GdbCommand::SelectThread(thread) => format!("-thread-select {}", thread),
        GdbCommand::SetSchedulerLocking(value) => {
            format!("-gdb-set scheduler-locking {}", on_off(*value))
        }
        GdbCommand::SetPagination(value) => format!("-gdb-set pagination {}", on_off(*value)),
        GdbCommand::SetConfirm(value) => format!("-gdb-set confirm {}", on_off(*value)),
        GdbCommand::CatchSyscall(name) => {
            format!("-interpreter-exec console \"catch syscall {}\"", name)
        }
        GdbCommand::DeleteBreakpoints => "-break-delete".to_owned(),
        GdbCommand::Quit => "-gdb-exit".to_owned(),
    }
}

fn break_insert_line(spec: &BreakpointSpec) -> String {
    match spec.kind {
        BreakpointKind::Code => {
            let mut line = String::from("-break-insert");
            if spec.temporary {
                line.push_str(" -t");
            }
            if let Some(thread) = spec.thread {
                line.push_str(&format!(" -p {}", thread));
            }
            line.push_str(&format!(" {}", spec.location));
            line
        }
        BreakpointKind::AccessWatch => format!("-break-watch -a {}", spec.location),
    }
}

impl Debugger for GdbMiSession {
    fn execute(&mut self, command: &GdbCommand) -> Result<(), GatewayError> {
        let line = mi_line(command);
        let accepted: &[&str] = match command {
            GdbCommand::Run | GdbCommand::Continue | GdbCommand::Finish => &["running", "done"],
            GdbCommand::Quit => &["exit", "done"],
            _ => &["done"],
        };
        let result = self.command_result(&line, accepted);
        match command {
            GdbCommand::Quit => {
                // gdb may close the pipe instead of answering.
                self.gdb_exited = true;
                if result.is_err() {
                    return Ok(());
                }
            }
            GdbCommand::SelectThread(thread) => {
                if result.is_ok() {
                    self.selected = *thread;
                }
            }
            _ => {}
        }
        result.map(|_| ())
    }

    fn insert_breakpoint(
        &mut self,
        spec: &BreakpointSpec,
    ) -> Result<BreakpointHandle, GatewayError> {
        let line = break_insert_line(spec);
        let results =
            self.command_result(&line, &["done"])
                .map_err(|err| GatewayError::Breakpoint {
                    location: spec.location.to_string(),
                    message: err.to_string(),
                })?;
        let number = ["bkpt", "wpt", "hw-awpt", "hw-rwpt"]
            .iter()
            .find_map(|key| mi::find(&results, key))
            .and_then(MiValue::as_tuple)
            .and_then(|bp| mi::find(bp, "number"))
            .and_then(MiValue::as_const)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                GatewayError::Protocol(format!("no breakpoint number in reply to `{}`", line))
            })?;
        trace!("breakpoint {} installed at {}", number, spec.location);
        Ok(BreakpointHandle {
            number,
            spec: spec.clone(),
        })
    }

    fn live_threads(&mut self) -> Result<Vec<ThreadId>, GatewayError> {
        Ok(self.live.iter().copied().collect())
    }

    fn selected_thread(&mut self) -> Result<ThreadId, GatewayError> {
        Ok(self.selected)
    }

    fn current_pc(&mut self) -> Result<CodeAddr, GatewayError> {
        let results = self.command_result("-stack-info-frame", &["done"])?;
        frame_addr(mi::find(&results, "frame"))
            .ok_or_else(|| GatewayError::Protocol("no frame address".to_owned()))
    }

    fn caller_pc(&mut self) -> Result<CodeAddr, GatewayError> {
        let results = self.command_result("-stack-list-frames 1 1", &["done"])?;
        let stack = mi::find(&results, "stack")
            .and_then(MiValue::as_list)
            .ok_or_else(|| GatewayError::Protocol("no stack in frame listing".to_owned()))?;
        let first = stack
            .first()
            .and_then(MiValue::as_tuple)
            .ok_or_else(|| GatewayError::Protocol("empty caller frame listing".to_owned()))?;
        frame_addr(mi::find(first, "frame"))
            .ok_or_else(|| GatewayError::Protocol("no caller frame address".to_owned()))
    }

    fn wait_event(&mut self) -> Result<Option<DebuggerEvent>, GatewayError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        if self.gdb_exited {
            return Ok(None);
        }
        loop {
            match self.read_record()? {
                None => return Ok(None),
                Some(MiRecord::Prompt) => continue,
                Some(MiRecord::Stream { text, .. }) => trace!("mi -> {}", text.trim_end()),
                Some(MiRecord::Result { class, .. }) => {
                    // A result with no command in flight; nothing to pair it
                    // with, so it is only worth a note.
                    warn!("stray MI result record `^{}`", class);
                }
                Some(record) => {
                    if let Some(event) = self.translate(record) {
                        return Ok(Some(event));
                    }
                }
            }
        }
    }
}

impl Drop for GdbMiSession {
    fn drop(&mut self) {
        if !self.gdb_exited {
            let _ = writeln!(self.stdin, "-gdb-exit");
        }
        let _ = self.child.wait();
    }
}

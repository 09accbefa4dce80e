//! The event pump that runs the orchestrators on the debugger's event
//! stream. Work done inside a listener is either immediate (queries,
//! breakpoint installation while stopped) or deferred onto a FIFO that is
//! drained after the listener returns and only while the target is stopped,
//! so resuming commands never execute re-entrantly.

use super::{
    BreakpointHandle, BreakpointSpec, Debugger, DebuggerEvent, EventStream, GatewayError,
    GdbCommand, ListenerId, ListenerRef, ThreadId,
};
use crate::code_addr::CodeAddr;
use crate::error::Error;
use log::{debug, error, trace};
use std::collections::HashMap;
use std::collections::VecDeque;

/// Work posted by a listener, executed in FIFO order once the current
/// listener has returned and the target is stopped.
pub enum DeferredOp {
    Execute(GdbCommand),
    InsertBreakpoint(BreakpointSpec),
    Connect(EventStream, ListenerRef),
    Disconnect(EventStream, ListenerId),
}

#[derive(Default)]
struct ControlState {
    queue: VecDeque<DeferredOp>,
    target_running: bool,
    quit_requested: bool,
}

/// The listener-facing face of the gateway: every immediate operation of the
/// underlying debugger plus the enqueue variant of each.
pub struct Gateway<'a> {
    debugger: &'a mut dyn Debugger,
    state: &'a mut ControlState,
}

impl Gateway<'_> {
    pub fn execute(&mut self, command: &GdbCommand) -> Result<(), GatewayError> {
        trace!("executing `{}`", command);
        self.debugger.execute(command)?;
        if command.resumes_target() {
            self.state.target_running = true;
        }
        if *command == GdbCommand::Quit {
            self.state.quit_requested = true;
        }
        Ok(())
    }

    pub fn insert_breakpoint(
        &mut self,
        spec: &BreakpointSpec,
    ) -> Result<BreakpointHandle, GatewayError> {
        self.debugger.insert_breakpoint(spec)
    }

    pub fn live_threads(&mut self) -> Result<Vec<ThreadId>, GatewayError> {
        self.debugger.live_threads()
    }

    pub fn selected_thread(&mut self) -> Result<ThreadId, GatewayError> {
        self.debugger.selected_thread()
    }

    pub fn current_pc(&mut self) -> Result<CodeAddr, GatewayError> {
        self.debugger.current_pc()
    }

    pub fn caller_pc(&mut self) -> Result<CodeAddr, GatewayError> {
        self.debugger.caller_pc()
    }

    pub fn enqueue_execute(&mut self, command: GdbCommand) {
        trace!("enqueueing `{}`", command);
        self.state.queue.push_back(DeferredOp::Execute(command));
    }

    pub fn enqueue_insert_breakpoint(&mut self, spec: BreakpointSpec) {
        self.state.queue.push_back(DeferredOp::InsertBreakpoint(spec));
    }

    pub fn enqueue_connect(&mut self, stream: EventStream, listener: ListenerRef) {
        self.state.queue.push_back(DeferredOp::Connect(stream, listener));
    }

    pub fn enqueue_disconnect(&mut self, stream: EventStream, listener: ListenerId) {
        self.state
            .queue
            .push_back(DeferredOp::Disconnect(stream, listener));
    }
}

#[derive(Default)]
struct EventRegistry {
    next_id: ListenerId,
    streams: HashMap<EventStream, Vec<(ListenerId, ListenerRef)>>,
}

impl EventRegistry {
    fn connect(&mut self, stream: EventStream, listener: ListenerRef) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.streams.entry(stream).or_default().push((id, listener));
        id
    }

    fn disconnect(&mut self, stream: EventStream, id: ListenerId) {
        if let Some(listeners) = self.streams.get_mut(&stream) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    fn listeners(&self, stream: EventStream) -> Vec<ListenerRef> {
        self.streams
            .get(&stream)
            .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }
}

/// Owns the concrete debugger, the listener registry and the deferred-op
/// queue, and pumps events until the debugger terminates. A listener error
/// is remembered and converted into an enqueued `quit` rather than escaping
/// into the event loop; the first one is returned when the pump exits.
pub struct DebuggerDriver<D: Debugger> {
    debugger: D,
    registry: EventRegistry,
    state: ControlState,
    first_error: Option<Error>,
}

impl<D: Debugger> DebuggerDriver<D> {
    pub fn new(debugger: D) -> DebuggerDriver<D> {
        DebuggerDriver {
            debugger,
            registry: EventRegistry::default(),
            state: ControlState::default(),
            first_error: None,
        }
    }

    /// Immediate gateway access, for setup work done outside any listener.
    pub fn gateway(&mut self) -> Gateway<'_> {
        Gateway {
            debugger: &mut self.debugger,
            state: &mut self.state,
        }
    }

    pub fn connect(&mut self, stream: EventStream, listener: ListenerRef) -> ListenerId {
        self.registry.connect(stream, listener)
    }

    pub fn disconnect(&mut self, stream: EventStream, id: ListenerId) {
        self.registry.disconnect(stream, id);
    }

    pub fn debugger(&self) -> &D {
        &self.debugger
    }

    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            let event = match self.debugger.wait_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    if !self.state.quit_requested {
                        self.record_error(err.into());
                    }
                    break;
                }
            };
            // Any of these means the previously selected thread is no longer
            // making progress, so deferred work may be issued again.
            if !matches!(event, DebuggerEvent::NewThread(_)) {
                self.state.target_running = false;
            }
            self.dispatch(event);
            self.drain();
        }
        match self.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, event: DebuggerEvent) {
        debug!("event: {:?}", event);
        for listener in self.registry.listeners(event.stream()) {
            let mut gateway = Gateway {
                debugger: &mut self.debugger,
                state: &mut self.state,
            };
            if let Err(err) = listener.borrow_mut().on_event(&mut gateway, &event) {
                error!("terminating after listener failure: {}", err);
                self.record_error(err);
                self.state
                    .queue
                    .push_back(DeferredOp::Execute(GdbCommand::Quit));
            }
        }
    }

    fn drain(&mut self) {
        while !self.state.target_running {
            let op = match self.state.queue.pop_front() {
                Some(op) => op,
                None => return,
            };
            match op {
                DeferredOp::Execute(command) => {
                    let mut gateway = Gateway {
                        debugger: &mut self.debugger,
                        state: &mut self.state,
                    };
                    if let Err(err) = gateway.execute(&command) {
                        if command == GdbCommand::Quit {
                            // Nothing left to shut down.
                            self.state.quit_requested = true;
                            return;
                        }
                        self.record_error(err.into());
                        self.state
                            .queue
                            .push_back(DeferredOp::Execute(GdbCommand::Quit));
                    }
                }
                DeferredOp::InsertBreakpoint(spec) => {
                    if let Err(err) = self.debugger.insert_breakpoint(&spec) {
                        self.record_error(err.into());
                        self.state
                            .queue
                            .push_back(DeferredOp::Execute(GdbCommand::Quit));
                    }
                }
                DeferredOp::Connect(stream, listener) => {
                    self.registry.connect(stream, listener);
                }
                DeferredOp::Disconnect(stream, id) => {
                    self.registry.disconnect(stream, id);
                }
            }
        }
    }

    fn record_error(&mut self, err: Error) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::testing::{ScriptedDebugger, Step};
    use crate::gdb::{ExitedEvent, StopEvent};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Enqueues a fixed batch of commands on the first stop it sees.
    struct BatchListener {
        batch: Vec<GdbCommand>,
        fired: bool,
    }

    impl crate::gdb::EventListener for BatchListener {
        fn on_event(
            &mut self,
            gdb: &mut Gateway<'_>,
            _event: &DebuggerEvent,
        ) -> Result<(), Error> {
            if !self.fired {
                self.fired = true;
                for command in self.batch.drain(..) {
                    gdb.enqueue_execute(command);
                }
            }
            Ok(())
        }
    }

    struct FailingListener;

    impl crate::gdb::EventListener for FailingListener {
        fn on_event(
            &mut self,
            _gdb: &mut Gateway<'_>,
            _event: &DebuggerEvent,
        ) -> Result<(), Error> {
            Err(Error::SetupFailed("boom".to_owned()))
        }
    }

    fn stop(thread: ThreadId) -> DebuggerEvent {
        DebuggerEvent::Stop(StopEvent {
            thread,
            pc: None,
            breakpoint: None,
        })
    }

    #[test]
    fn deferred_commands_drain_in_fifo_order_after_the_listener_returns() {
        let script = vec![Step::event(stop(1)), Step::event(stop(1))];
        let mut driver = DebuggerDriver::new(ScriptedDebugger::new(script));
        let listener = Rc::new(RefCell::new(BatchListener {
            batch: vec![GdbCommand::SelectThread(2), GdbCommand::Continue],
            fired: false,
        }));
        driver.connect(EventStream::Stop, listener);
        driver.run().unwrap();
        assert_eq!(driver.debugger().issued(), &["thread 2", "continue"]);
    }

    #[test]
    fn deferred_work_waits_until_the_target_stops() {
        // Continue is executed on the first stop; the batch enqueued while
        // running must not drain until the second stop arrives.
        let script = vec![Step::event(stop(1)), Step::event(stop(1))];
        let mut driver = DebuggerDriver::new(ScriptedDebugger::new(script));
        let listener = Rc::new(RefCell::new(BatchListener {
            batch: vec![
                GdbCommand::Continue,
                GdbCommand::SelectThread(2),
                GdbCommand::Continue,
            ],
            fired: false,
        }));
        driver.connect(EventStream::Stop, listener);
        driver.run().unwrap();
        assert_eq!(driver.debugger().issued(), &["continue", "thread 2", "continue"]);
    }

    #[test]
    fn listener_failure_is_returned_and_quits_the_debugger() {
        let script = vec![Step::event(stop(1)), Step::event(stop(1))];
        let mut driver = DebuggerDriver::new(ScriptedDebugger::new(script));
        driver.connect(EventStream::Stop, Rc::new(RefCell::new(FailingListener)));
        let err = driver.run().unwrap_err();
        assert!(matches!(err, Error::SetupFailed(_)));
        assert_eq!(driver.debugger().issued(), &["quit"]);
    }

    #[test]
    fn enqueued_connect_and_disconnect_take_effect_between_events() {
        struct ConnectOnce {
            to_add: Option<ListenerRef>,
        }
        impl crate::gdb::EventListener for ConnectOnce {
            fn on_event(
                &mut self,
                gdb: &mut Gateway<'_>,
                _event: &DebuggerEvent,
            ) -> Result<(), Error> {
                if let Some(listener) = self.to_add.take() {
                    gdb.enqueue_connect(EventStream::Exited, listener);
                }
                Ok(())
            }
        }

        let counter = Rc::new(RefCell::new(BatchListener {
            batch: vec![GdbCommand::Quit],
            fired: false,
        }));
        let script = vec![
            Step::event(stop(1)),
            Step::event(DebuggerEvent::Exited(ExitedEvent { exit_code: Some(0) })),
        ];
        let mut driver = DebuggerDriver::new(ScriptedDebugger::new(script));
        let connector = Rc::new(RefCell::new(ConnectOnce {
            to_add: Some(counter.clone() as ListenerRef),
        }));
        driver.connect(EventStream::Stop, connector);
        driver.run().unwrap();
        // The late-connected listener saw the exited event and quit.
        assert_eq!(driver.debugger().issued(), &["quit"]);
    }
}

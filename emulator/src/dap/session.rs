//! One DAP session over a TCP connection
//!
//! Two threads per connection: the receiver reads frames and answers the
//! requests that touch no machine state, handing everything else to the
//! executor through a work queue. The executor owns the machine, the
//! breakpoint set and the debug info; it answers state requests and runs
//! the program, emitting `stopped`/`terminated` events. Outgoing frames
//! share one mutex, which also owns the monotonic sequence counter, so
//! frames never interleave and a response always precedes the events its
//! request caused. `pause` and `disconnect` are atomic flags the run loop
//! observes between instructions.

use std::collections::HashSet;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::codec::{self, CodecError};
use super::protocol::{Event, Message, Response};
use crate::assembler::{assemble, DebugInfo};
use crate::constants as C;
use crate::runtime::{Instruction, Machine, Reg, StepOutcome, Termination};

struct Outgoing {
    stream: TcpStream,
    seq: i64,
}

struct Shared {
    outgoing: Mutex<Outgoing>,
    pause: AtomicBool,
    running: AtomicBool,
    terminated: AtomicBool,
}

impl Shared {
    fn send(&self, build: impl FnOnce(i64) -> Message) {
        let mut outgoing = match self.outgoing.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let seq = outgoing.seq;
        outgoing.seq += 1;
        let message = build(seq);
        if let Err(error) = codec::write_message(&mut outgoing.stream, &message) {
            warn!(%error, "failed to send frame");
        }
    }

    fn respond(
        &self,
        request_seq: i64,
        command: &str,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) {
        self.send(|seq| {
            Message::Response(Response {
                seq,
                request_seq,
                success,
                command: command.to_string(),
                message,
                body,
            })
        });
    }

    fn event(&self, event: &str, body: Option<Value>) {
        self.send(|seq| {
            Message::Event(Event {
                seq,
                event: event.to_string(),
                body,
            })
        });
    }

    fn stopped(&self, reason: &str, description: Option<&str>) {
        let mut body = json!({
            "reason": reason,
            "threadId": 1,
            "allThreadsStopped": true,
        });
        if let Some(description) = description {
            body["description"] = json!(description);
        }
        self.event("stopped", Some(body));
    }
}

struct Work {
    seq: i64,
    command: String,
    arguments: Value,
}

/// Serve one connection until the client disconnects
pub(super) fn run_session(stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    let read_half = match stream.try_clone() {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, "could not split connection");
            return;
        }
    };
    let shared = Arc::new(Shared {
        outgoing: Mutex::new(Outgoing { stream, seq: 1 }),
        pause: AtomicBool::new(false),
        running: AtomicBool::new(false),
        terminated: AtomicBool::new(false),
    });

    let (tx, rx) = channel();
    let executor = {
        let shared = Arc::clone(&shared);
        std::thread::spawn(move || Executor::new(shared).run(rx))
    };

    receive_loop(BufReader::new(read_half), &shared, &tx);

    shared.terminated.store(true, Ordering::SeqCst);
    drop(tx);
    let _ = executor.join();
    info!(?peer, "DAP session closed");
}

fn receive_loop(mut reader: BufReader<TcpStream>, shared: &Shared, tx: &Sender<Work>) {
    while !shared.terminated.load(Ordering::SeqCst) {
        let request = match codec::read_message(&mut reader) {
            Ok(Some(Message::Request(request))) => request,
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(CodecError::Io(_)) => break,
            Err(error @ CodecError::MissingContentLength) => {
                // Without a length the stream cannot be re-synced
                warn!(%error, "closing connection");
                break;
            }
            Err(error) => {
                warn!(%error, "dropping malformed frame");
                continue;
            }
        };

        debug!(command = %request.command, seq = request.seq, "request");
        match request.command.as_str() {
            "initialize" => {
                shared.respond(
                    request.seq,
                    "initialize",
                    true,
                    None,
                    Some(json!({
                        "supportsConfigurationDoneRequest": true,
                        "supportsTerminateRequest": true,
                        "supportsRestartRequest": false,
                        "supportsCancelRequest": false,
                    })),
                );
                shared.event("initialized", None);
            }

            "attach" => shared.respond(
                request.seq,
                "attach",
                false,
                Some("Attach not supported".to_string()),
                None,
            ),

            "pause" => {
                shared.pause.store(true, Ordering::SeqCst);
                shared.respond(request.seq, "pause", true, None, None);
                if !shared.running.load(Ordering::SeqCst) {
                    // Nothing to preempt; report the stop right away
                    shared.pause.store(false, Ordering::SeqCst);
                    shared.stopped("pause", None);
                }
            }

            "disconnect" | "terminate" => {
                shared.terminated.store(true, Ordering::SeqCst);
                shared.respond(request.seq, &request.command, true, None, None);
                shared.event("terminated", None);
                break;
            }

            // These touch no machine state and may not wait for a run to end
            "threads" => shared.respond(
                request.seq,
                "threads",
                true,
                None,
                Some(json!({"threads": [{"id": 1, "name": "COMET2"}]})),
            ),

            "scopes" => shared.respond(
                request.seq,
                "scopes",
                true,
                None,
                Some(json!({
                    "scopes": [{
                        "name": "Registers",
                        "variablesReference": 1,
                        "expensive": false,
                    }]
                })),
            ),

            "launch" | "setBreakpoints" | "configurationDone" | "stackTrace" | "variables"
            | "continue" | "next" | "stepIn" | "stepOut" => {
                let work = Work {
                    seq: request.seq,
                    command: request.command,
                    arguments: request.arguments,
                };
                if tx.send(work).is_err() {
                    break;
                }
            }

            unknown => shared.respond(
                request.seq,
                unknown,
                false,
                Some(format!("Unknown command: {unknown}")),
                None,
            ),
        }
    }
}

enum RunStop {
    Silent,
    Paused,
    Breakpoint,
    AwaitInput,
    Finished,
    Fault(Termination),
}

struct Executor {
    shared: Arc<Shared>,
    machine: Option<Machine>,
    debug_info: Option<DebugInfo>,
    breakpoints: HashSet<C::Address>,
    stop_on_entry: bool,
    program: String,
}

fn flush_output(shared: &Shared, machine: &mut Machine) {
    for line in machine.take_output() {
        shared.event(
            "output",
            Some(json!({"category": "stdout", "output": format!("{line}\n")})),
        );
    }
}

impl Executor {
    fn new(shared: Arc<Shared>) -> Executor {
        Executor {
            shared,
            machine: None,
            debug_info: None,
            breakpoints: HashSet::new(),
            stop_on_entry: false,
            program: String::new(),
        }
    }

    fn run(mut self, rx: Receiver<Work>) {
        while let Ok(work) = rx.recv() {
            if self.shared.terminated.load(Ordering::SeqCst) {
                break;
            }
            self.handle(work);
        }
    }

    fn handle(&mut self, work: Work) {
        let Work {
            seq,
            command,
            arguments,
        } = work;

        match command.as_str() {
            "launch" => self.launch(seq, &arguments),
            "setBreakpoints" => self.set_breakpoints(seq, &arguments),

            "configurationDone" => {
                self.shared.respond(seq, "configurationDone", true, None, None);
                if self.machine.is_some() {
                    if self.stop_on_entry {
                        self.shared.stopped("entry", None);
                    } else {
                        self.run_loop(false);
                    }
                }
            }

            "stackTrace" => self.stack_trace(seq),
            "variables" => self.variables(seq),

            "continue" => {
                self.shared.respond(
                    seq,
                    "continue",
                    true,
                    None,
                    Some(json!({"allThreadsContinued": true})),
                );
                // Step off a breakpoint at the current PC before checking
                self.run_loop(true);
            }

            "next" | "stepIn" => {
                self.shared.respond(seq, &command, true, None, None);
                self.single_step();
            }

            "stepOut" => {
                self.shared.respond(seq, "stepOut", true, None, None);
                self.step_out();
            }

            _ => {}
        }
    }

    fn launch(&mut self, seq: i64, arguments: &Value) {
        let Some(program) = arguments.get("program").and_then(Value::as_str) else {
            self.shared.respond(
                seq,
                "launch",
                false,
                Some("Missing 'program' argument".to_string()),
                None,
            );
            return;
        };
        self.stop_on_entry = arguments
            .get("stopOnEntry")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let source = match std::fs::read_to_string(program) {
            Ok(source) => source,
            Err(error) => {
                self.shared.respond(
                    seq,
                    "launch",
                    false,
                    Some(format!("Cannot read file: {error}")),
                    None,
                );
                return;
            }
        };

        match assemble(&source) {
            Ok(assembly) => {
                info!(program, start = assembly.start, "program launched");
                self.program = program.to_string();
                self.machine = Some(Machine::new(&assembly));
                self.debug_info = Some(assembly.debug_info);
                self.shared.respond(seq, "launch", true, None, None);
            }
            Err(error) => self.shared.respond(
                seq,
                "launch",
                false,
                Some(format!("Assembly failed: {error}")),
                None,
            ),
        }
    }

    fn set_breakpoints(&mut self, seq: i64, arguments: &Value) {
        self.breakpoints.clear();
        let requested = arguments
            .get("breakpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::with_capacity(requested.len());
        for breakpoint in &requested {
            let line = breakpoint.get("line").and_then(Value::as_u64);
            let address = line.and_then(|line| {
                self.debug_info
                    .as_ref()
                    .and_then(|info| info.address_for_line(line as usize))
            });
            match (line, address) {
                (Some(line), Some(address)) => {
                    debug!(line, address, "breakpoint verified");
                    self.breakpoints.insert(address);
                    results.push(json!({"verified": true, "line": line}));
                }
                (Some(line), None) => results.push(json!({"verified": false, "line": line})),
                (None, _) => results.push(json!({"verified": false})),
            }
        }

        self.shared.respond(
            seq,
            "setBreakpoints",
            true,
            None,
            Some(json!({"breakpoints": results})),
        );
    }

    fn no_program(&self, seq: i64, command: &str) {
        self.shared
            .respond(seq, command, false, Some("No program loaded".to_string()), None);
    }

    fn stack_trace(&self, seq: i64) {
        let Some(machine) = &self.machine else {
            return self.no_program(seq, "stackTrace");
        };
        let line = self
            .debug_info
            .as_ref()
            .and_then(|info| info.line_for_address(machine.registers.pc))
            .unwrap_or(0);
        self.shared.respond(
            seq,
            "stackTrace",
            true,
            None,
            Some(json!({
                "stackFrames": [{
                    "id": 1,
                    "name": "main",
                    "line": line,
                    "column": 0,
                    "source": {"name": self.program, "path": self.program},
                }],
                "totalFrames": 1,
            })),
        );
    }

    fn variables(&self, seq: i64) {
        let Some(machine) = &self.machine else {
            return self.no_program(seq, "variables");
        };
        let registers = &machine.registers;
        let variables: Vec<Value> = Reg::ALL
            .iter()
            .map(|&reg| {
                let word = registers.get(reg);
                let value = match reg {
                    Reg::Fr => format!("{word}"),
                    // PC and SP read as unsigned, the GRs as signed
                    Reg::Pc | Reg::Sp => format!("#{word:04X} ({word})"),
                    _ => format!("#{:04X} ({})", word, word as i16),
                };
                json!({"name": reg.to_string(), "value": value, "variablesReference": 0})
            })
            .collect();
        self.shared.respond(
            seq,
            "variables",
            true,
            None,
            Some(json!({"variables": variables})),
        );
    }

    fn run_loop(&mut self, step_off_breakpoint: bool) {
        let Some(machine) = self.machine.as_mut() else {
            return;
        };
        self.shared.running.store(true, Ordering::SeqCst);

        let mut skip_check = step_off_breakpoint;
        let outcome = loop {
            if self.shared.terminated.load(Ordering::SeqCst) {
                break RunStop::Silent;
            }
            if self.shared.pause.swap(false, Ordering::SeqCst) {
                break RunStop::Paused;
            }
            if !skip_check && self.breakpoints.contains(&machine.registers.pc) {
                break RunStop::Breakpoint;
            }
            skip_check = false;

            match machine.step() {
                StepOutcome::Continue => flush_output(&self.shared, machine),
                StepOutcome::AwaitInput => break RunStop::AwaitInput,
                StepOutcome::Halt(termination) => {
                    flush_output(&self.shared, machine);
                    if termination.is_clean() {
                        break RunStop::Finished;
                    }
                    break RunStop::Fault(termination);
                }
            }
        };

        self.shared.running.store(false, Ordering::SeqCst);
        match outcome {
            RunStop::Silent => {}
            RunStop::Paused => self.shared.stopped("pause", None),
            RunStop::Breakpoint => self.shared.stopped("breakpoint", None),
            RunStop::AwaitInput => self.shared.stopped("pause", Some("Waiting for input")),
            RunStop::Finished => self.shared.event("terminated", None),
            RunStop::Fault(termination) => {
                self.shared.stopped("exception", Some(&termination.to_string()));
            }
        }
    }

    fn single_step(&mut self) {
        let Some(machine) = self.machine.as_mut() else {
            return;
        };
        match machine.step() {
            StepOutcome::Continue => {
                flush_output(&self.shared, machine);
                self.shared.stopped("step", None);
            }
            StepOutcome::AwaitInput => self.shared.stopped("pause", Some("Waiting for input")),
            StepOutcome::Halt(termination) => {
                flush_output(&self.shared, machine);
                self.shared.stopped("exception", Some(&termination.to_string()));
            }
        }
    }

    /// Step until the instruction just executed was a RET, a breakpoint is
    /// reached, or the machine stops on its own
    fn step_out(&mut self) {
        let Some(machine) = self.machine.as_mut() else {
            return;
        };
        loop {
            if self.shared.terminated.load(Ordering::SeqCst) {
                return;
            }
            let returning = matches!(machine.current_instruction(), Some(Instruction::Ret));
            match machine.step() {
                StepOutcome::Continue => {
                    flush_output(&self.shared, machine);
                    if returning || self.breakpoints.contains(&machine.registers.pc) {
                        break;
                    }
                }
                StepOutcome::AwaitInput => {
                    self.shared.stopped("pause", Some("Waiting for input"));
                    return;
                }
                StepOutcome::Halt(termination) => {
                    flush_output(&self.shared, machine);
                    self.shared.stopped("exception", Some(&termination.to_string()));
                    return;
                }
            }
        }
        self.shared.stopped("step", None);
    }
}

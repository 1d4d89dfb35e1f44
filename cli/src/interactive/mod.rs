//! The interactive COMET II console
//!
//! Line editing comes from rustyline and the command grammar from clap,
//! the same arrangement the debugger-style REPLs in this family use: each
//! input line is split with shell-words and fed to a derived Parser.

use std::collections::VecDeque;

use clap::Parser;
use comet2_emulator::runtime::{disassemble, Machine, StepOutcome, Termination};
use rustyline::{Behavior, CompletionType, Config, DefaultEditor, EditMode};
use tracing::debug;

static HELP: &str = r#"
Run "help [command]" for command-specific help.
An empty line re-runs the last valid command."#;

#[derive(Parser, Clone, Debug)]
#[command(
    help_template = "{about}\n\nCOMMANDS:\n{subcommands}\n{after-help}",
    after_help = HELP,
    disable_version_flag = true,
    infer_subcommands = true,
    no_binary_name = true,
    allow_negative_numbers = true,
)]
/// Interactive mode commands
enum Command {
    /// Start execution of the program
    #[command(alias = "r")]
    Run,

    /// Step execution, N instructions at a time
    #[command(alias = "s")]
    Step {
        #[arg(value_parser, default_value = "1")]
        number: u64,
    },

    /// Print the PC/FR/SP and general registers
    #[command(alias = "p")]
    Print,

    /// Dump 128 words of memory from ADDRESS (default: PC)
    #[command(alias = "du")]
    Dump {
        #[arg(value_parser = parse_address)]
        address: Option<u16>,
    },

    /// Dump 128 words of the stack
    #[command(alias = "st")]
    Stack,

    /// Disassemble 16 instructions from ADDRESS (default: PC)
    #[command(alias = "di")]
    Disasm {
        #[arg(value_parser = parse_address)]
        address: Option<u16>,
    },

    /// Exit the emulator
    #[command(alias = "q")]
    Quit,
}

/// An address argument: decimal, or `#` plus hex digits
fn parse_address(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix('#') {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

pub(crate) fn run_interactive(
    machine: &mut Machine,
    inputs: Vec<String>,
    start_running: bool,
) -> anyhow::Result<()> {
    let config = Config::builder()
        .history_ignore_space(true)
        .completion_type(CompletionType::List)
        .edit_mode(EditMode::Emacs)
        .behavior(Behavior::PreferTerm)
        .auto_add_history(true)
        .build();
    let mut rl = DefaultEditor::with_config(config)?;

    let mut inputs: VecDeque<String> = inputs.into();
    let mut last_command: Option<Command> = None;
    let mut pending = start_running.then_some(Command::Run);
    let mut halted = false;

    'read: loop {
        let command = if let Some(command) = pending.take() {
            command
        } else {
            let Ok(readline) = rl.readline("comet2> ") else {
                break;
            };

            if readline.trim().is_empty() {
                let Some(command) = last_command.clone() else {
                    println!("Type \"help\" to get the list of available commands");
                    continue 'read;
                };
                command
            } else {
                let Ok(words) = shell_words::split(readline.as_str()) else {
                    println!("Invalid input");
                    continue 'read;
                };
                match Command::try_parse_from(words) {
                    Ok(command) => {
                        last_command = Some(command.clone());
                        command
                    }
                    Err(e) => {
                        let _ = e.print();
                        continue 'read;
                    }
                }
            }
        };

        debug!("Executing command: {:?}", command);

        match (command, halted) {
            (Command::Quit, _) => break,

            (Command::Run, false) => loop {
                match machine.step() {
                    StepOutcome::Continue => print_output(machine),
                    StepOutcome::AwaitInput => feed(machine, &mut inputs, &mut rl)?,
                    StepOutcome::Halt(termination) => {
                        print_output(machine);
                        finish(&termination, &mut halted);
                        continue 'read;
                    }
                }
            },

            (Command::Step { number }, false) => {
                for _ in 0..number {
                    match machine.step() {
                        StepOutcome::Continue => print_output(machine),
                        StepOutcome::AwaitInput => feed(machine, &mut inputs, &mut rl)?,
                        StepOutcome::Halt(termination) => {
                            print_output(machine);
                            finish(&termination, &mut halted);
                            continue 'read;
                        }
                    }
                }
                print_state(machine);
            }

            (Command::Print, _) => print_state(machine),

            (Command::Dump { address }, _) => {
                dump(machine, address.unwrap_or(machine.registers.pc));
            }

            (Command::Stack, _) => dump(machine, machine.registers.sp),

            (Command::Disasm { address }, _) => {
                disasm(machine, address.unwrap_or(machine.registers.pc));
            }

            (_, true) => {
                println!("Program has stopped. Use \"quit\" to exit.");
            }
        }
    }

    Ok(())
}

/// Answer a pending SVC IN from the queued inputs, then the terminal
fn feed(
    machine: &mut Machine,
    inputs: &mut VecDeque<String>,
    rl: &mut DefaultEditor,
) -> anyhow::Result<()> {
    let line = match inputs.pop_front() {
        Some(line) => {
            println!("IN> {line}");
            line
        }
        None => rl.readline("IN> ")?,
    };
    machine.feed_input(&line);
    Ok(())
}

fn finish(termination: &Termination, halted: &mut bool) {
    println!("{termination}");
    *halted = true;
}

fn print_output(machine: &mut Machine) {
    for line in machine.take_output() {
        println!("{line}");
    }
}

fn print_state(machine: &Machine) {
    let registers = &machine.registers;
    let (current, _) = disassemble(&machine.memory, registers.pc);

    println!();
    println!("PR  #{:04x} [ {} ]", registers.pc, current);
    println!(
        "SP  #{:04x} ({:6})  FR  {} ({:6})",
        registers.sp,
        registers.sp as i16,
        registers.fr,
        registers.fr.bits()
    );
    for row in 0..2 {
        let mut line = String::new();
        for col in 0..4 {
            let i = row * 4 + col;
            let value = registers.gr[i];
            line.push_str(&format!("GR{i} #{value:04x} ({:6})  ", value as i16));
        }
        println!("{}", line.trim_end());
    }
}

fn dump(machine: &Machine, base: u16) {
    for row in 0..16u16 {
        let start = base.wrapping_add(row * 8);
        let mut line = format!("{start:04x}:");
        for col in 0..8 {
            line.push_str(&format!(
                " {:04x}",
                machine.memory.get(start.wrapping_add(col))
            ));
        }
        line.push(' ');
        for col in 0..8 {
            let byte = (machine.memory.get(start.wrapping_add(col)) & 0xff) as u8;
            line.push(if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            });
        }
        println!("{line}");
    }
}

fn disasm(machine: &Machine, base: u16) {
    let mut address = base;
    for _ in 0..16 {
        let (text, size) = disassemble(&machine.memory, address);
        println!("#{address:04x}\t{text}");
        address = address.wrapping_add(size);
    }
}

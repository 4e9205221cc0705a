mod args;

use args::parse_args;
use rustyline::error::ReadlineError;
use rustyline::Editor;
use std::io;
use std::process::exit;
use vm::ExitStatus;

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("usage: lox [path] [--stress-gc] [--dump]");
            exit(exitcode::USAGE);
        }
    };

    match args.path {
        Some(path) => run_file(&path, args.stress_gc, args.dump),
        None => run_repl(args.stress_gc),
    }
}

fn run_file(path: &std::path::Path, stress_gc: bool, dump: bool) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("could not read '{}': {err}", path.display());
            exit(exitcode::IOERR);
        }
    };
    let status = run_source(&source, stress_gc, dump);
    exit(match status {
        ExitStatus::Ok => exitcode::OK,
        ExitStatus::CompileError => exitcode::DATAERR,
        ExitStatus::RuntimeError => exitcode::SOFTWARE,
    });
}

fn run_repl(stress_gc: bool) {
    let mut rl = Editor::<()>::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                run_source(&line, stress_gc, false);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("readline error: {err}");
                break;
            }
        }
    }
}

fn run_source(source: &str, stress_gc: bool, dump: bool) -> ExitStatus {
    if dump {
        match compiler::compile(source) {
            Ok(function) => print!("{}", compiler::disasm::disassemble_function(&function)),
            Err(errors) => {
                for error in &errors {
                    eprintln!("{error}");
                }
                return ExitStatus::CompileError;
            }
        }
    }

    let stdout = io::stdout();
    let stderr = io::stderr();
    let stdin = io::stdin();
    let mut stdout = stdout.lock();
    let mut stderr = stderr.lock();
    let mut stdin = stdin.lock();
    vm::run_string(source, &mut stdout, &mut stderr, &mut stdin, stress_gc)
}

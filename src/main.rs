use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::{env, fs};

use tracing_subscriber::EnvFilter;

use alox::vm::error::InterpretError;
use alox::Vm;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: alox [path]");
            ExitCode::from(64)
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read {}: {}", path, err);
            return ExitCode::from(74);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err {
                InterpretError::Static(_) => 65,
                InterpretError::Runtime(_) => 70,
            };
            render(&err);
            ExitCode::from(code)
        }
    }
}

fn repl() -> ExitCode {
    let mut vm = Vm::new();
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        io::stdout().flush().ok();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {
                // errors are reported and the session continues
                if let Err(err) = vm.interpret(&line) {
                    render(&err);
                }
            }
            Err(err) => {
                eprintln!("Could not read input: {}", err);
                return ExitCode::from(74);
            }
        }
    }

    ExitCode::SUCCESS
}

fn render(err: &dyn miette::Diagnostic) {
    let mut out = String::new();
    if miette::GraphicalReportHandler::new()
        .render_report(&mut out, err)
        .is_ok()
    {
        eprintln!("{}", out);
    } else {
        eprintln!("{}", err);
    }
}

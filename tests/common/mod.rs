use std::sync::{Arc, Mutex};

use alox::{SharedWriter, Vm};

/// Runs a program on a fresh VM, returning captured stdout on success and
/// the rendered error message on failure.
pub fn run_program(source: &str) -> Result<String, String> {
    let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let mut vm = Vm::with_output(SharedWriter::from_shared(buffer.clone()));

    vm.interpret(source).map_err(|err| err.to_string())?;

    let out = buffer.lock().unwrap().clone();
    Ok(String::from_utf8(out).expect("programs print valid utf-8"))
}

/// Lines printed by a program, in order.
pub fn run_lines(source: &str) -> Result<Vec<String>, String> {
    run_program(source).map(|out| out.lines().map(str::to_string).collect())
}

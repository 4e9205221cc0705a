use crate::value::Value;
use crate::Vm;
use std::io::Read;

fn expect_number(value: &Value, who: &str) -> Result<f64, String> {
    match value {
        Value::Number(n) => Ok(*n),
        other => Err(format!(
            "{who} expects a number argument, got {}.",
            other.type_name()
        )),
    }
}

fn expect_string_bytes<'a>(vm: &'a Vm, value: &Value, who: &str) -> Result<&'a [u8], String> {
    match value.as_obj().and_then(|h| vm.heap.as_bytes(h)) {
        Some(s) => Ok(s),
        None => Err(format!("{who} expects a string argument.")),
    }
}

/// `clock() -> number`: seconds elapsed since the VM started, as a float.
pub fn clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.started_at.elapsed().as_secs_f64()))
}

/// `exit(code)`: terminates the process immediately with `code`.
pub fn exit(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let code = expect_number(&args[0], "exit")?;
    std::process::exit(code as i32);
}

/// `getc() -> number`: reads one byte from stdin, or `-1` at end of input.
pub fn getc(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let mut byte = [0u8; 1];
    match vm.stdin.read(&mut byte) {
        Ok(0) => Ok(Value::Number(-1.0)),
        Ok(_) => Ok(Value::Number(byte[0] as f64)),
        Err(err) => Err(format!("could not read stdin: {err}")),
    }
}

/// `chr(n) -> string`: the one-byte string holding byte value `n` (0-255).
pub fn chr(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let n = expect_number(&args[0], "chr")?;
    let byte = n as i64;
    if !(0..=255).contains(&byte) {
        return Err(format!("{byte} is not a valid byte value."));
    }
    let handle = vm.heap.intern_bytes(&[byte as u8]);
    Ok(Value::Obj(handle))
}

/// `ord(s) -> number`: the value of `s`'s first byte.
pub fn ord(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let bytes = expect_string_bytes(vm, &args[0], "ord")?;
    let byte = bytes.first().ok_or_else(|| "ord expects a non-empty string.".to_string())?;
    Ok(Value::Number(*byte as f64))
}

/// `print_error(v)`: writes `v`'s display form to stderr, followed by a
/// newline.
pub fn print_error(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let rendered = vm.heap.display(&args[0]);
    use std::io::Write;
    writeln!(vm.stderr, "{rendered}").ok();
    Ok(Value::Nil)
}

//! Interactive CLI front-end (spec.md §6): loads a `.wasm` module, then
//! reads exported-function invocations from stdin until `quit` or EOF.

use std::fmt::Write as _;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use wasmc::decode::decode_module;
use wasmc::engine::Instance;
use wasmc::host::EmptyHost;
use wasmc::storage::Buffer;
use wasmc::types::{ExportDescriptor, ValType};
use wasmc::value::Value;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut args = std::env::args_os().skip(1);
    let path = match (args.next(), args.next()) {
        (Some(path), None) => path,
        _ => {
            eprintln!("usage: wasmc <module.wasm>");
            return ExitCode::from(2);
        }
    };

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("{}: {err}", path.to_string_lossy());
            return ExitCode::from(2);
        }
    };

    let module = match decode_module(Buffer::new(&bytes)) {
        Ok(module) => module,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };

    let mut instance = match Instance::instantiate(&module, &EmptyHost) {
        Ok(instance) => instance,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };

    if let Err(trap) = instance.run_start() {
        eprintln!("Exception: {trap}");
        return ExitCode::from(2);
    }

    run_repl(&mut instance);
    ExitCode::SUCCESS
}

fn run_repl(instance: &mut Instance) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("wasmc$ ");
        let _ = stdout.flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }

        let mut tokens = line.split_whitespace();
        let name = tokens.next().unwrap();
        let arg_tokens: Vec<&str> = tokens.collect();

        match invoke(instance, name, &arg_tokens) {
            Ok(output) => println!("{output}"),
            Err(msg) => println!("Exception: {msg}"),
        }
    }
}

fn invoke(instance: &mut Instance, name: &str, arg_tokens: &[&str]) -> Result<String, String> {
    let descriptor = instance
        .export(name)
        .ok_or_else(|| format!("no export named '{name}'"))?;
    let func_idx = match descriptor {
        ExportDescriptor::Function(idx) => *idx,
        _ => return Err(format!("'{name}' is not a function export")),
    };

    let ty = instance.func_type(func_idx).clone();
    if arg_tokens.len() != ty.params.len() {
        return Err(format!(
            "'{name}' expects {} argument(s), got {}",
            ty.params.len(),
            arg_tokens.len()
        ));
    }

    let mut args = Vec::with_capacity(ty.params.len());
    for (token, kind) in arg_tokens.iter().zip(ty.params.iter()) {
        args.push(parse_arg(token, *kind)?);
    }

    let results = instance
        .call(func_idx, &args)
        .map_err(|trap| trap.to_string())?;

    let mut out = String::new();
    for (i, value) in results.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{value}");
    }
    Ok(out)
}

// Parses one REPL argument per its declared kind (spec.md §6): `i32`/`i64`
// as unsigned-looking integer literals (accepting a leading `-`, mirroring
// `strtoul`/`strtoull`'s wraparound on negative input), `f32`/`f64` as
// floating-point literals, with the case-insensitive literal `-nan`
// special-cased to a negative quiet NaN.
fn parse_arg(token: &str, kind: ValType) -> Result<Value, String> {
    match kind {
        ValType::I32 => {
            let v = parse_u64_like(token)? as u32;
            Ok(Value::I32(v as i32))
        }
        ValType::I64 => {
            let v = parse_u64_like(token)?;
            Ok(Value::I64(v as i64))
        }
        ValType::F32 => Ok(Value::F32(parse_float(token)? as f32)),
        ValType::F64 => Ok(Value::F64(parse_float(token)?)),
    }
}

fn parse_u64_like(token: &str) -> Result<u64, String> {
    if let Some(rest) = token.strip_prefix('-') {
        let v: u64 = rest
            .parse()
            .map_err(|_| format!("invalid integer literal '{token}'"))?;
        Ok(v.wrapping_neg())
    } else if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| format!("invalid integer literal '{token}'"))
    } else {
        token
            .parse()
            .map_err(|_| format!("invalid integer literal '{token}'"))
    }
}

fn parse_float(token: &str) -> Result<f64, String> {
    if token.eq_ignore_ascii_case("-nan") {
        return Ok(-f64::NAN);
    }
    token
        .parse()
        .map_err(|_| format!("invalid float literal '{token}'"))
}

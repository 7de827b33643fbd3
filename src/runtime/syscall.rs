//! Host services, dispatched from opcode 0x03 by a one-byte id.
//!
//! Every variadic syscall takes its argument count last: pop the count,
//! then that many arguments. Method-style ids additionally pop their
//! receiver (pushed after the arguments by the compiler). Handlers work
//! directly against the VM's stack and adjust it in place; unknown ids
//! are tolerated silently for forward compatibility.

use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{Local, TimeZone};

use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::value::Value;
use crate::runtime::vm::Vm;

pub fn dispatch(vm: &mut Vm, id: u8) -> Result<(), RuntimeError> {
    match id {
        0x60 => sys_print(vm),
        0x61 => sys_puts(vm),
        0x62 => sys_strlen(vm),
        0x63 => sys_len(vm),
        0x70 => sys_fopen(vm),
        0x71 => sys_fprintf(vm),
        0x72 => sys_fclose(vm),
        0x80 => sys_time(vm),
        0x81 => sys_ctime(vm),
        0x90..=0x98 => sys_collections(vm, id),
        0xA0..=0xA7 => sys_string_method(vm, id),
        // The list-method family wraps around the math and system ids.
        0xA8..=0xAF | 0xB4..=0xBF | 0xC3..=0xC9 => sys_list_method(vm, id),
        0xB0 => sys_sqrt(vm),
        0xB1 => sys_abs(vm),
        0xB2 => sys_const(vm, std::f64::consts::PI),
        0xB3 => sys_const(vm, std::f64::consts::E),
        0xC0 => sys_exit(vm, false),
        0xC1 => sys_system(vm),
        0xC2 => sys_sleep(vm),
        0xCA => sys_random(vm),
        0xD0 => sys_malloc(vm),
        0xD1 => sys_calloc(vm),
        0xD2 => sys_realloc(vm),
        0xD3 => sys_free(vm),
        0xD4..=0xDE => sys_conversions(vm, id),
        0xE0 => sys_abort(vm),
        0xE1 => sys_exit(vm, true),
        0xE2 => sys_atexit(vm, false),
        0xE3 => sys_atexit(vm, true),
        0xE4 => sys_quick_exit(vm),
        0xE5 => sys_getenv(vm),
        0xE6 => sys_bsearch(vm),
        0xE7 => sys_qsort(vm),
        0xE8 => sys_range(vm),
        0xE9 => sys_min_max(vm, true),
        0xEA => sys_min_max(vm, false),
        0xEB => sys_sum(vm),
        0xEC => sys_sorted(vm),
        0xED => sys_int(vm),
        0xEE => sys_float(vm),
        0xEF => sys_str(vm),
        0xF0 => sys_bool(vm),
        0xF1 => sys_tuple(vm),
        0xF2 => sys_chr(vm),
        0xF3 => sys_ord(vm),
        0xF4 => sys_round(vm),
        0xF5 => sys_divmod(vm),
        0xF6 => sys_pow(vm),
        0xF7 => sys_all_any(vm, true),
        0xF8 => sys_all_any(vm, false),
        0xF9 => sys_repr(vm),
        0xFA => sys_radix(vm, 2),
        0xFB => sys_radix(vm, 16),
        0xFC => sys_radix(vm, 8),
        0xFD => sys_input(vm),
        0xFE => sys_zip(vm),
        0xFF => sys_enumerate(vm),
        other => {
            // Forward compatibility: consume the variadic frame, do
            // nothing.
            log::warn!("unknown syscall 0x{:02X} ignored", other);
            let _ = variadic(vm);
            Ok(())
        }
    }
}

// ── Argument plumbing ────────────────────────────────────────────────

/// Pops the count, then that many arguments, returned in push order.
fn variadic(vm: &mut Vm) -> Result<Vec<Value>, RuntimeError> {
    let count = vm.pop()?.coerce_i64().max(0) as usize;
    let count = count.min(vm.stack.len());
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(vm.pop()?);
    }
    args.reverse();
    Ok(args)
}

/// Method protocol: count, then the receiver, then the arguments.
fn method_args(vm: &mut Vm) -> Result<(Value, Vec<Value>), RuntimeError> {
    let count = vm.pop()?.coerce_i64().max(0) as usize;
    let receiver = vm.pop()?;
    let count = count.min(vm.stack.len());
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(vm.pop()?);
    }
    args.reverse();
    Ok((receiver, args))
}

fn write_out(vm: &mut Vm, text: &str) {
    let _ = vm.out.write_all(text.as_bytes());
}

// ── Formatting ───────────────────────────────────────────────────────

/// printf-style substitution for %d, %s, %f (and %%); a literal `\n`
/// sequence in the format becomes a real newline.
fn format_printf(fmt: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut arg_i = 0usize;
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '%' => match chars.peek() {
                Some('d') | Some('i') => {
                    chars.next();
                    let v = args.get(arg_i).map(|v| v.coerce_i64()).unwrap_or(0);
                    arg_i += 1;
                    out.push_str(&v.to_string());
                }
                Some('s') => {
                    chars.next();
                    if let Some(v) = args.get(arg_i) {
                        out.push_str(&v.to_string());
                    }
                    arg_i += 1;
                }
                Some('f') => {
                    chars.next();
                    let v = args.get(arg_i).map(|v| v.coerce_f64()).unwrap_or(0.0);
                    arg_i += 1;
                    out.push_str(&format!("{:.6}", v));
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            },
            '\\' if chars.peek() == Some(&'n') => {
                chars.next();
                out.push('\n');
            }
            other => out.push(other),
        }
    }
    out
}

fn is_format_string(s: &str) -> bool {
    s.contains("%d") || s.contains("%i") || s.contains("%s") || s.contains("%f")
}

// ── Console and files ────────────────────────────────────────────────

fn sys_print(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    if args.is_empty() {
        write_out(vm, "\n");
        return Ok(());
    }
    if let Value::Str(fmt) = &args[0] {
        if is_format_string(fmt) {
            let text = format_printf(fmt, &args[1..]);
            write_out(vm, &text);
            return Ok(());
        }
    }
    let joined = args
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    write_out(vm, &joined);
    write_out(vm, "\n");
    Ok(())
}

fn sys_puts(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let text = args.first().map(|v| v.to_string()).unwrap_or_default();
    write_out(vm, &text);
    write_out(vm, "\n");
    Ok(())
}

fn sys_strlen(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let target = match args.into_iter().next() {
        Some(v) => v,
        None => vm.pop()?,
    };
    let len = match &target {
        Value::Str(s) => s.len() as i64,
        v if v.is_numeric() => vm.memory.c_string(v.coerce_i64())?.len() as i64,
        _ => 0,
    };
    vm.push(Value::Int(len as i32))
}

/// Shared by `len(x)` (plain, count 1) and `.size()` (method, count 0
/// with the receiver beneath).
fn sys_len(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let target = match args.into_iter().next() {
        Some(v) => v,
        None => vm.pop()?,
    };
    let len = match &target {
        Value::Str(s) => s.chars().count(),
        Value::List(items) | Value::Set(items) => items.borrow().len(),
        Value::Dict(entries) => entries.borrow().len(),
        other => {
            log::warn!("len of {}", other.type_name());
            0
        }
    };
    vm.push(Value::Int(len as i32))
}

fn sys_fopen(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let path = args.first().map(|v| v.to_string()).unwrap_or_default();
    let mode = args.get(1).map(|v| v.to_string()).unwrap_or_else(|| "r".to_string());
    let handle = vm.vfs.open(&path, &mode);
    vm.push(Value::Int(handle))
}

fn sys_fprintf(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let handle = args.first().map(|v| v.coerce_i32()).unwrap_or(0);
    let text = match args.get(1) {
        Some(Value::Str(fmt)) if is_format_string(fmt) => format_printf(fmt, &args[2..]),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let written = vm.vfs.write(handle, text.as_bytes());
    vm.push(Value::Int(written as i32))
}

fn sys_fclose(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let handle = args.first().map(|v| v.coerce_i32()).unwrap_or(0);
    vm.vfs.close(handle);
    vm.push(Value::Int(0))
}

// ── Time ─────────────────────────────────────────────────────────────

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn sys_time(vm: &mut Vm) -> Result<(), RuntimeError> {
    variadic(vm)?;
    vm.push(Value::Int(now_secs() as i32))
}

fn sys_ctime(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let secs = args
        .first()
        .filter(|v| v.is_numeric())
        .map(|v| v.coerce_i64())
        .unwrap_or_else(now_secs);
    let text = Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.format("%a %b %e %H:%M:%S %Y").to_string())
        .unwrap_or_default();
    vm.push(Value::Str(format!("{}\n", text)))
}

// ── Collections (syscall forms of 0x90–0x98) ─────────────────────────

fn sys_collections(vm: &mut Vm, id: u8) -> Result<(), RuntimeError> {
    match id {
        0x90 => {
            // set() or set(iterable)
            let args = variadic(vm)?;
            let mut items: Vec<Value> = Vec::new();
            if let Some(source) = args.first().and_then(|v| v.iteration_items()) {
                for v in source {
                    if !items.iter().any(|x| x.loose_eq(&v)) {
                        items.push(v);
                    }
                }
            }
            vm.push(Value::set(items))
        }
        0x91 => {
            let (receiver, args) = method_args(vm)?;
            if let Value::Set(items) = &receiver {
                let mut items = items.borrow_mut();
                for v in args {
                    if !items.iter().any(|x| x.loose_eq(&v)) {
                        items.push(v);
                    }
                }
            } else {
                log::warn!(".add on {}", receiver.type_name());
            }
            Ok(())
        }
        0x92 => {
            variadic(vm)?;
            vm.push(Value::dict(Vec::new()))
        }
        0x93 => {
            let (receiver, mut args) = method_args(vm)?;
            if args.len() >= 2 {
                let value = args.pop().unwrap_or(Value::Null);
                let key = args.pop().unwrap_or(Value::Null);
                vm.collection_set(&receiver, key, value)?;
            }
            Ok(())
        }
        0x94 => {
            // .get(key[, default]) is lenient where the index opcode is
            // not.
            let (receiver, args) = method_args(vm)?;
            let key = args.first().cloned().unwrap_or(Value::Null);
            let fallback = args.get(1).cloned().unwrap_or(Value::Null);
            let found = match &receiver {
                Value::Dict(entries) => entries
                    .borrow()
                    .iter()
                    .find(|(k, _)| k.loose_eq(&key))
                    .map(|(_, v)| v.clone()),
                Value::List(items) => {
                    let items = items.borrow();
                    let index = key.coerce_i64();
                    if index >= 0 && (index as usize) < items.len() {
                        Some(items[index as usize].clone())
                    } else {
                        None
                    }
                }
                _ => None,
            };
            vm.push(found.unwrap_or(fallback))
        }
        0x95 => {
            // list() / list(iterable)
            let args = variadic(vm)?;
            let items = args
                .first()
                .and_then(|v| v.iteration_items())
                .unwrap_or_default();
            vm.push(Value::list(items))
        }
        0x96 => {
            let (receiver, args) = method_args(vm)?;
            if let Value::List(items) = &receiver {
                items.borrow_mut().extend(args);
            } else {
                log::warn!(".push_back on {}", receiver.type_name());
            }
            Ok(())
        }
        0x97 => {
            let (receiver, _) = method_args(vm)?;
            let v = match &receiver {
                Value::List(items) => {
                    let mut items = items.borrow_mut();
                    if items.is_empty() {
                        Value::Null
                    } else {
                        items.remove(0)
                    }
                }
                _ => Value::Null,
            };
            vm.push(v)
        }
        _ => {
            // 0x98: .pop([index])
            let (receiver, args) = method_args(vm)?;
            let v = match &receiver {
                Value::List(items) => {
                    let mut items = items.borrow_mut();
                    match args.first() {
                        Some(index) => {
                            let i = index.coerce_i64();
                            if i >= 0 && (i as usize) < items.len() {
                                items.remove(i as usize)
                            } else {
                                Value::Null
                            }
                        }
                        None => items.pop().unwrap_or(Value::Null),
                    }
                }
                _ => Value::Null,
            };
            vm.push(v)
        }
    }
}

// ── String methods ───────────────────────────────────────────────────

fn sys_string_method(vm: &mut Vm, id: u8) -> Result<(), RuntimeError> {
    let (receiver, args) = method_args(vm)?;
    let Value::Str(s) = &receiver else {
        log::warn!("string method 0x{:02X} on {}", id, receiver.type_name());
        return vm.push(Value::Null);
    };

    let result = match id {
        0xA0 => Value::Str(s.to_lowercase()),
        0xA1 => Value::Str(s.to_uppercase()),
        0xA2 => {
            let parts: Vec<Value> = match args.first() {
                Some(Value::Str(sep)) if !sep.is_empty() => {
                    s.split(sep.as_str()).map(|p| Value::Str(p.to_string())).collect()
                }
                _ => s.split_whitespace().map(|p| Value::Str(p.to_string())).collect(),
            };
            Value::list(parts)
        }
        0xA3 => {
            // receiver is the separator: "sep".join(list)
            let joined = args
                .first()
                .and_then(|v| v.iteration_items())
                .unwrap_or_default()
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(s);
            Value::Str(joined)
        }
        0xA4 => {
            let from = args.first().map(|v| v.to_string()).unwrap_or_default();
            let to = args.get(1).map(|v| v.to_string()).unwrap_or_default();
            if from.is_empty() {
                Value::Str(s.clone())
            } else {
                Value::Str(s.replace(&from, &to))
            }
        }
        0xA5 => {
            let needle = args.first().map(|v| v.to_string()).unwrap_or_default();
            match s.find(&needle) {
                Some(byte_at) => Value::Int(s[..byte_at].chars().count() as i32),
                None => Value::Int(-1),
            }
        }
        0xA6 => {
            let prefix = args.first().map(|v| v.to_string()).unwrap_or_default();
            Value::Int(s.starts_with(&prefix) as i32)
        }
        _ => {
            // 0xA7 strip([chars])
            match args.first() {
                Some(Value::Str(set)) if !set.is_empty() => {
                    let set: Vec<char> = set.chars().collect();
                    Value::Str(s.trim_matches(|c| set.contains(&c)).to_string())
                }
                _ => Value::Str(s.trim().to_string()),
            }
        }
    };
    vm.push(result)
}

// ── C++ list methods ─────────────────────────────────────────────────

fn sys_list_method(vm: &mut Vm, id: u8) -> Result<(), RuntimeError> {
    // 0xC9 is reversed(list): plain variadic, no receiver.
    if id == 0xC9 {
        let args = variadic(vm)?;
        let mut items = args
            .first()
            .and_then(|v| v.iteration_items())
            .unwrap_or_default();
        items.reverse();
        return vm.push(Value::list(items));
    }

    let (receiver, args) = method_args(vm)?;
    let Value::List(items) = &receiver else {
        log::warn!("list method 0x{:02X} on {}", id, receiver.type_name());
        return Ok(());
    };

    match id {
        // assign(n, value): n copies of value
        0xA8 => {
            let n = args.first().map(|v| v.coerce_i64().max(0)).unwrap_or(0) as usize;
            let fill = args.get(1).cloned().unwrap_or(Value::Null);
            let mut items = items.borrow_mut();
            items.clear();
            items.resize(n, fill);
            Ok(())
        }
        0xA9 => {
            let v = items.borrow().first().cloned().unwrap_or(Value::Null);
            vm.push(v)
        }
        0xAA => {
            let v = items.borrow().last().cloned().unwrap_or(Value::Null);
            vm.push(v)
        }
        // Iterator positions are sentinel index 0.
        0xAB | 0xAC | 0xAD | 0xAE => vm.push(Value::Int(0)),
        0xAF => {
            let empty = items.borrow().is_empty();
            vm.push(Value::Int(empty as i32))
        }
        0xB4 => vm.push(Value::Int(i32::MAX)),
        0xB5 => {
            items.borrow_mut().clear();
            Ok(())
        }
        0xB6 => {
            let pos = args.first().map(|v| v.coerce_i64().max(0)).unwrap_or(0) as usize;
            let value = args.get(1).cloned().unwrap_or(Value::Null);
            let mut items = items.borrow_mut();
            let pos = pos.min(items.len());
            items.insert(pos, value);
            Ok(())
        }
        0xB7 => {
            let pos = args.first().map(|v| v.coerce_i64()).unwrap_or(-1);
            let mut items = items.borrow_mut();
            if pos >= 0 && (pos as usize) < items.len() {
                items.remove(pos as usize);
            }
            Ok(())
        }
        0xB8 => {
            let mut items = items.borrow_mut();
            for (i, v) in args.into_iter().enumerate() {
                items.insert(i, v);
            }
            Ok(())
        }
        0xB9 => {
            let incoming = args
                .first()
                .and_then(|v| v.iteration_items())
                .unwrap_or_default();
            let mut items = items.borrow_mut();
            for (i, v) in incoming.into_iter().enumerate() {
                items.insert(i, v);
            }
            Ok(())
        }
        0xBA => {
            let incoming = args
                .first()
                .and_then(|v| v.iteration_items())
                .unwrap_or_default();
            items.borrow_mut().extend(incoming);
            Ok(())
        }
        0xBB => {
            let n = args.first().map(|v| v.coerce_i64().max(0)).unwrap_or(0) as usize;
            let fill = args.get(1).cloned().unwrap_or(Value::Null);
            items.borrow_mut().resize(n, fill);
            Ok(())
        }
        0xBC => {
            if let Some(Value::List(other)) = args.first() {
                if !Rc::ptr_eq(items, other) {
                    std::mem::swap(&mut *items.borrow_mut(), &mut *other.borrow_mut());
                }
            }
            Ok(())
        }
        0xBD => {
            sort_values(&mut items.borrow_mut());
            Ok(())
        }
        0xBE => {
            let mut items = items.borrow_mut();
            let mut deduped: Vec<Value> = Vec::with_capacity(items.len());
            for v in items.drain(..) {
                if deduped.last().map_or(true, |prev| !prev.loose_eq(&v)) {
                    deduped.push(v);
                }
            }
            *items = deduped;
            Ok(())
        }
        0xBF => {
            items.borrow_mut().reverse();
            Ok(())
        }
        0xC3 => {
            if let Some(Value::List(other)) = args.first() {
                if !Rc::ptr_eq(items, other) {
                    let drained: Vec<Value> = other.borrow_mut().drain(..).collect();
                    let mut items = items.borrow_mut();
                    items.extend(drained);
                    sort_values(&mut items);
                }
            }
            Ok(())
        }
        0xC4 => {
            // splice: move the contents of the list argument in.
            for arg in &args {
                if let Value::List(other) = arg {
                    if !Rc::ptr_eq(items, other) {
                        let drained: Vec<Value> = other.borrow_mut().drain(..).collect();
                        items.borrow_mut().extend(drained);
                    }
                    break;
                }
            }
            Ok(())
        }
        0xC5 => {
            let target = args.first().cloned().unwrap_or(Value::Null);
            items.borrow_mut().retain(|v| !v.loose_eq(&target));
            Ok(())
        }
        0xC6 => {
            // remove_if(pred): pred is a guest function.
            let Some(pred) = args.first().cloned() else {
                return Ok(());
            };
            let snapshot: Vec<Value> = items.borrow().clone();
            let mut kept = Vec::with_capacity(snapshot.len());
            for v in snapshot {
                let verdict = vm.call_function(&pred, &[v.clone()])?;
                if !verdict.truthy() {
                    kept.push(v);
                }
            }
            *items.borrow_mut() = kept;
            Ok(())
        }
        0xC7 => {
            let equal = args
                .first()
                .map(|other| receiver.loose_eq(other))
                .unwrap_or(false);
            vm.push(Value::Int(equal as i32))
        }
        0xC8 => {
            use std::cmp::Ordering;
            let ordering = args
                .first()
                .and_then(|other| receiver.loose_cmp(other))
                .unwrap_or(Ordering::Equal);
            vm.push(Value::Int(match ordering {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            }))
        }
        other => {
            log::warn!("unknown list method 0x{:02X} ignored", other);
            Ok(())
        }
    }
}

fn sort_values(items: &mut Vec<Value>) {
    use std::cmp::Ordering;
    items.sort_by(|a, b| a.loose_cmp(b).unwrap_or(Ordering::Equal));
}

// ── Math, system, process ────────────────────────────────────────────

fn sys_sqrt(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let x = args.first().map(|v| v.coerce_f64()).unwrap_or(0.0);
    vm.push(Value::Float(x.sqrt()))
}

fn sys_abs(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let v = match args.into_iter().next() {
        Some(Value::Int(n)) => Value::Int(n.wrapping_abs()),
        Some(Value::Long(n)) => Value::Long(n.wrapping_abs()),
        Some(Value::Float(n)) => Value::Float(n.abs()),
        Some(other) => Value::Int(other.coerce_i32().wrapping_abs()),
        None => Value::Int(0),
    };
    vm.push(v)
}

fn sys_const(vm: &mut Vm, value: f64) -> Result<(), RuntimeError> {
    variadic(vm)?;
    vm.push(Value::Float(value))
}

fn sys_exit(vm: &mut Vm, skip_atexit: bool) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let code = args.first().map(|v| v.coerce_i32()).unwrap_or(0);
    vm.exit_code = Some(code);
    vm.skip_atexit = vm.skip_atexit || skip_atexit;
    vm.running = false;
    Ok(())
}

fn sys_system(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let command = args.first().map(|v| v.to_string()).unwrap_or_default();
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .status()
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1);
    vm.push(Value::Int(status))
}

fn sys_sleep(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let secs = args.first().map(|v| v.coerce_f64()).unwrap_or(0.0).max(0.0);
    // Cooperative model: sleeping busy-waits, nothing else interleaves.
    let deadline = Instant::now() + Duration::from_secs_f64(secs);
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
    Ok(())
}

fn sys_random(vm: &mut Vm) -> Result<(), RuntimeError> {
    variadic(vm)?;
    let value = (vm.next_random() >> 33) as i32;
    vm.push(Value::Int(value))
}

// ── C memory ─────────────────────────────────────────────────────────

fn sys_malloc(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let n = args.first().map(|v| v.coerce_i64()).unwrap_or(0);
    let addr = vm.allocator.malloc(n)?;
    vm.push(Value::Int(addr))
}

fn sys_calloc(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let count = args.first().map(|v| v.coerce_i64()).unwrap_or(0);
    let size = args.get(1).map(|v| v.coerce_i64()).unwrap_or(0);
    let total = count.saturating_mul(size);
    let addr = vm.allocator.malloc(total)?;
    if addr != 0 {
        vm.memory.fill(addr as i64, 0, total)?;
    }
    vm.push(Value::Int(addr))
}

fn sys_realloc(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let addr = args.first().map(|v| v.coerce_i64()).unwrap_or(0);
    let n = args.get(1).map(|v| v.coerce_i64()).unwrap_or(0);
    let old_size = vm.allocator.size_of(addr).unwrap_or(0) as i64;
    let new_addr = vm.allocator.malloc(n)?;
    if addr != 0 && new_addr != 0 {
        vm.memory.copy(new_addr as i64, addr, old_size.min(n))?;
        vm.allocator.free(addr);
    }
    vm.push(Value::Int(new_addr))
}

fn sys_free(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let addr = args.first().map(|v| v.coerce_i64()).unwrap_or(0);
    vm.allocator.free(addr);
    Ok(())
}

// ── C conversions ────────────────────────────────────────────────────

/// strtol-style prefix parse: leading whitespace, optional sign, digits
/// in the given base, stopping at the first non-digit.
fn parse_int_prefix(s: &str, base: u32) -> i64 {
    let s = s.trim_start();
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let rest = if base == 16 {
        rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")).unwrap_or(rest)
    } else {
        rest
    };
    let mut value: i64 = 0;
    for c in rest.chars() {
        match c.to_digit(base) {
            Some(d) => value = value.wrapping_mul(base as i64).wrapping_add(d as i64),
            None => break,
        }
    }
    if negative {
        -value
    } else {
        value
    }
}

fn parse_float_prefix(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = 0usize;
    let bytes = s.as_bytes();
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        let c = bytes[end] as char;
        let ok = c.is_ascii_digit()
            || ((c == '-' || c == '+') && (end == 0 || bytes[end - 1] == b'e' || bytes[end - 1] == b'E'))
            || (c == '.' && !seen_dot && !seen_exp)
            || ((c == 'e' || c == 'E') && !seen_exp && end > 0);
        if !ok {
            break;
        }
        seen_dot |= c == '.';
        seen_exp |= c == 'e' || c == 'E';
        end += 1;
    }
    s[..end].parse::<f64>().unwrap_or(0.0)
}

fn sys_conversions(vm: &mut Vm, id: u8) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let text = args.first().map(|v| v.to_string()).unwrap_or_default();
    // strtol-family calls may carry a trailing base argument.
    let base = args
        .iter()
        .skip(1)
        .rev()
        .find(|v| v.is_numeric())
        .map(|v| v.coerce_i64())
        .filter(|b| (2..=36).contains(b))
        .unwrap_or(10) as u32;

    let result = match id {
        0xD4 => Value::Float(parse_float_prefix(&text)),            // atof
        0xD5 => Value::Int(parse_int_prefix(&text, 10) as i32),     // atoi
        0xD6 | 0xD7 => Value::Long(parse_int_prefix(&text, 10)),    // atol, atoll
        0xD8 | 0xDB => Value::Float(parse_float_prefix(&text)),     // strtod, strtold
        0xD9 => Value::Float(parse_float_prefix(&text) as f32 as f64), // strtof
        0xDA | 0xDC => Value::Long(parse_int_prefix(&text, base)),  // strtol, strtoll
        _ => Value::Long(parse_int_prefix(&text, base).max(0)),     // strtoul, strtoull
    };
    vm.push(result)
}

// ── Process control ──────────────────────────────────────────────────

fn sys_abort(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    match args.first() {
        Some(message) => eprintln!("abort: {}", message),
        None => eprintln!("abort"),
    }
    vm.exit_code = Some(134);
    vm.skip_atexit = true;
    vm.running = false;
    Ok(())
}

fn sys_atexit(vm: &mut Vm, quick: bool) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    if let Some(handler) = args.into_iter().next() {
        if quick {
            vm.quick_exit_fns.push(handler);
        } else {
            vm.atexit_fns.push(handler);
        }
    }
    vm.push(Value::Int(0))
}

fn sys_quick_exit(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let code = args.first().map(|v| v.coerce_i32()).unwrap_or(0);
    let handlers: Vec<Value> = vm.quick_exit_fns.drain(..).collect();
    for handler in handlers.iter().rev() {
        if let Err(e) = vm.call_function(handler, &[]) {
            log::warn!("quick_exit handler failed: {}", e);
        }
    }
    vm.exit_code = Some(code);
    vm.skip_atexit = true;
    vm.running = false;
    Ok(())
}

fn sys_getenv(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let name = args.first().map(|v| v.to_string()).unwrap_or_default();
    match std::env::var(&name) {
        Ok(value) => vm.push(Value::Str(value)),
        Err(_) => vm.push(Value::Null),
    }
}

// ── Search and sort with guest comparators ───────────────────────────

fn sys_bsearch(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let key = args.first().cloned().unwrap_or(Value::Null);
    let items = args
        .get(1)
        .and_then(|v| v.iteration_items())
        .unwrap_or_default();
    let Some(cmp) = args.get(2).cloned() else {
        return vm.push(Value::Int(-1));
    };

    let mut lo = 0usize;
    let mut hi = items.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let verdict = vm
            .call_function(&cmp, &[key.clone(), items[mid].clone()])?
            .coerce_i64();
        match verdict {
            0 => return vm.push(Value::Int(mid as i32)),
            v if v < 0 => hi = mid,
            _ => lo = mid + 1,
        }
    }
    vm.push(Value::Int(-1))
}

fn sys_qsort(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let Some(Value::List(items)) = args.first() else {
        return Ok(());
    };
    let Some(cmp) = args.get(1).cloned() else {
        return Ok(());
    };

    // Insertion sort: stable, and comparator errors propagate cleanly.
    let mut sorted: Vec<Value> = items.borrow().clone();
    for i in 1..sorted.len() {
        let mut j = i;
        while j > 0 {
            let verdict = vm
                .call_function(&cmp, &[sorted[j - 1].clone(), sorted[j].clone()])?
                .coerce_i64();
            if verdict <= 0 {
                break;
            }
            sorted.swap(j - 1, j);
            j -= 1;
        }
    }
    *items.borrow_mut() = sorted;
    Ok(())
}

// ── Python builtins ──────────────────────────────────────────────────

fn sys_range(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let (start, stop, step) = match args.len() {
        0 => (0, 0, 1),
        1 => (0, args[0].coerce_i64(), 1),
        2 => (args[0].coerce_i64(), args[1].coerce_i64(), 1),
        _ => (args[0].coerce_i64(), args[1].coerce_i64(), args[2].coerce_i64()),
    };
    let mut items = Vec::new();
    if step > 0 {
        let mut i = start;
        while i < stop {
            items.push(Value::Int(i as i32));
            i += step;
        }
    } else if step < 0 {
        let mut i = start;
        while i > stop {
            items.push(Value::Int(i as i32));
            i += step;
        }
    }
    vm.push(Value::list(items))
}

fn sys_min_max(vm: &mut Vm, want_min: bool) -> Result<(), RuntimeError> {
    use std::cmp::Ordering;
    let args = variadic(vm)?;
    let pool = if args.len() == 1 {
        args[0].iteration_items().unwrap_or_else(|| args.clone())
    } else {
        args
    };
    let mut best: Option<Value> = None;
    for v in pool {
        best = Some(match best {
            None => v,
            Some(current) => {
                let take = match v.loose_cmp(&current) {
                    Some(Ordering::Less) => want_min,
                    Some(Ordering::Greater) => !want_min,
                    _ => false,
                };
                if take {
                    v
                } else {
                    current
                }
            }
        });
    }
    vm.push(best.unwrap_or(Value::Null))
}

fn sys_sum(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let items = args
        .first()
        .and_then(|v| v.iteration_items())
        .unwrap_or(args);
    let any_float = items.iter().any(|v| matches!(v, Value::Float(_)));
    if any_float {
        let total: f64 = items.iter().map(|v| v.coerce_f64()).sum();
        vm.push(Value::Float(total))
    } else {
        let total: i64 = items.iter().fold(0i64, |acc, v| acc.wrapping_add(v.coerce_i64()));
        vm.push(narrow_i64(total))
    }
}

fn narrow_i64(value: i64) -> Value {
    if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
        Value::Int(value as i32)
    } else {
        Value::Long(value)
    }
}

fn sys_sorted(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let mut items = args
        .first()
        .and_then(|v| v.iteration_items())
        .unwrap_or_default();
    sort_values(&mut items);
    vm.push(Value::list(items))
}

fn sys_int(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let result = match args.first() {
        None => Value::Int(0),
        Some(Value::Str(s)) => {
            let base = args
                .get(1)
                .map(|v| v.coerce_i64())
                .filter(|b| (2..=36).contains(b))
                .unwrap_or(10) as u32;
            narrow_i64(parse_int_prefix(s, base))
        }
        Some(v) => narrow_i64(v.coerce_i64()),
    };
    vm.push(result)
}

fn sys_float(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let v = args.first().map(|v| v.coerce_f64()).unwrap_or(0.0);
    vm.push(Value::Float(v))
}

fn sys_str(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let s = args.first().map(|v| v.to_string()).unwrap_or_default();
    vm.push(Value::Str(s))
}

fn sys_bool(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let truthy = args.first().map(|v| v.truthy()).unwrap_or(false);
    vm.push(Value::Int(truthy as i32))
}

fn sys_tuple(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let items = args
        .first()
        .and_then(|v| v.iteration_items())
        .unwrap_or_default();
    vm.push(Value::list(items))
}

fn sys_chr(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let code = args.first().map(|v| v.coerce_i64()).unwrap_or(0);
    let s = u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(|c| c.to_string())
        .unwrap_or_default();
    vm.push(Value::Str(s))
}

fn sys_ord(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let code = args
        .first()
        .map(|v| v.to_string())
        .and_then(|s| s.chars().next().map(|c| c as i64))
        .unwrap_or(0);
    vm.push(Value::Int(code as i32))
}

fn sys_round(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let x = args.first().map(|v| v.coerce_f64()).unwrap_or(0.0);
    let result = match args.get(1) {
        Some(digits) => {
            let scale = 10f64.powi(digits.coerce_i32());
            Value::Float((x * scale).round() / scale)
        }
        None => narrow_i64(x.round() as i64),
    };
    vm.push(result)
}

fn sys_divmod(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let a = args.first().map(|v| v.coerce_i64()).unwrap_or(0);
    let b = args.get(1).map(|v| v.coerce_i64()).unwrap_or(0);
    let (q, r) = if b == 0 {
        log::warn!("divmod by zero yields (0, 0)");
        (0, 0)
    } else {
        // Floor division, Python semantics.
        let q = (a as f64 / b as f64).floor() as i64;
        (q, a - q * b)
    };
    vm.push(Value::list(vec![narrow_i64(q), narrow_i64(r)]))
}

fn sys_pow(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let a = args.first().cloned().unwrap_or(Value::Int(0));
    let b = args.get(1).cloned().unwrap_or(Value::Int(0));
    let modulus = args.get(2).map(|v| v.coerce_i64());

    let all_int = !matches!(a, Value::Float(_)) && !matches!(b, Value::Float(_));
    let result = if all_int && b.coerce_i64() >= 0 {
        let base = a.coerce_i64();
        let exp = b.coerce_i64();
        let mut acc: i64 = 1;
        for _ in 0..exp {
            acc = acc.wrapping_mul(base);
            if let Some(m) = modulus {
                if m != 0 {
                    acc = acc.rem_euclid(m);
                }
            }
        }
        narrow_i64(acc)
    } else {
        Value::Float(a.coerce_f64().powf(b.coerce_f64()))
    };
    vm.push(result)
}

fn sys_all_any(vm: &mut Vm, want_all: bool) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let items = args
        .first()
        .and_then(|v| v.iteration_items())
        .unwrap_or_default();
    let result = if want_all {
        items.iter().all(|v| v.truthy())
    } else {
        items.iter().any(|v| v.truthy())
    };
    vm.push(Value::Int(result as i32))
}

fn sys_repr(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let s = args.first().map(|v| v.repr()).unwrap_or_else(|| "None".to_string());
    vm.push(Value::Str(s))
}

fn sys_radix(vm: &mut Vm, base: u32) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let n = args.first().map(|v| v.coerce_i64()).unwrap_or(0);
    let magnitude = n.unsigned_abs();
    let body = match base {
        2 => format!("0b{:b}", magnitude),
        8 => format!("0o{:o}", magnitude),
        _ => format!("0x{:x}", magnitude),
    };
    let s = if n < 0 { format!("-{}", body) } else { body };
    vm.push(Value::Str(s))
}

fn sys_input(vm: &mut Vm) -> Result<(), RuntimeError> {
    use std::io::BufRead;
    let args = variadic(vm)?;
    if let Some(prompt) = args.first() {
        let text = prompt.to_string();
        write_out(vm, &text);
        let _ = vm.out.flush();
    }
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    vm.push(Value::Str(line))
}

fn sys_zip(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let sources: Vec<Vec<Value>> = args
        .iter()
        .map(|v| v.iteration_items().unwrap_or_default())
        .collect();
    let shortest = sources.iter().map(Vec::len).min().unwrap_or(0);
    let mut items = Vec::with_capacity(shortest);
    for i in 0..shortest {
        items.push(Value::list(
            sources.iter().map(|s| s[i].clone()).collect(),
        ));
    }
    vm.push(Value::list(items))
}

fn sys_enumerate(vm: &mut Vm) -> Result<(), RuntimeError> {
    let args = variadic(vm)?;
    let items = args
        .first()
        .and_then(|v| v.iteration_items())
        .unwrap_or_default();
    let start = args.get(1).map(|v| v.coerce_i64()).unwrap_or(0);
    let pairs: Vec<Value> = items
        .into_iter()
        .enumerate()
        .map(|(i, v)| Value::list(vec![narrow_i64(start + i as i64), v]))
        .collect();
    vm.push(Value::list(pairs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compiler::Compiler;
    use crate::frontend::lexer::Lexer;
    use crate::runtime::vm::VmConfig;
    use std::cell::RefCell;
    use std::io::Write;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fresh_vm() -> (Vm, SharedBuf) {
        let buf = SharedBuf::default();
        let config = VmConfig {
            ramfs: true,
            ..VmConfig::default()
        };
        (
            Vm::with_output(Vec::new(), config, Box::new(buf.clone())),
            buf,
        )
    }

    /// Plain syscall: push args + count, dispatch, return the result.
    fn call(vm: &mut Vm, id: u8, args: Vec<Value>) -> Option<Value> {
        let base = vm.stack().len();
        let count = args.len();
        for a in args {
            vm.push(a).unwrap();
        }
        vm.push(Value::Int(count as i32)).unwrap();
        dispatch(vm, id).unwrap();
        if vm.stack().len() > base {
            Some(vm.pop().unwrap())
        } else {
            None
        }
    }

    /// Method syscall: args, then receiver, then count.
    fn call_method(vm: &mut Vm, id: u8, receiver: Value, args: Vec<Value>) -> Option<Value> {
        let base = vm.stack().len();
        let count = args.len();
        for a in args {
            vm.push(a).unwrap();
        }
        vm.push(receiver).unwrap();
        vm.push(Value::Int(count as i32)).unwrap();
        dispatch(vm, id).unwrap();
        if vm.stack().len() > base {
            Some(vm.pop().unwrap())
        } else {
            None
        }
    }

    fn run_source(source: &str) -> (String, i32, Vm) {
        let mut lexer = Lexer::new(source, true);
        let tokens = lexer.tokenize().expect("lex");
        let code = Compiler::new(tokens).compile().expect("compile");
        let buf = SharedBuf::default();
        let config = VmConfig {
            ramfs: true,
            ..VmConfig::default()
        };
        let mut vm = Vm::with_output(code, config, Box::new(buf.clone()));
        let exit = vm.run().expect("run");
        (buf.contents(), exit, vm)
    }

    // ── printing ─────────────────────────────────────────────────────

    #[test]
    fn test_printf_formats() {
        let (mut vm, buf) = fresh_vm();
        call(
            &mut vm,
            0x60,
            vec![
                Value::Str("x=%d y=%s z=%f\n".into()),
                Value::Int(4),
                Value::Str("ok".into()),
                Value::Float(1.5),
            ],
        );
        assert_eq!(buf.contents(), "x=4 y=ok z=1.500000\n");
    }

    #[test]
    fn test_print_joins_with_spaces_and_newline() {
        let (mut vm, buf) = fresh_vm();
        call(
            &mut vm,
            0x60,
            vec![Value::Int(1), Value::Str("a".into()), Value::Int(2)],
        );
        assert_eq!(buf.contents(), "1 a 2\n");
    }

    #[test]
    fn test_printf_literal_backslash_n() {
        assert_eq!(format_printf("a\\nb", &[]), "a\nb");
        assert_eq!(format_printf("100%% sure", &[]), "100% sure");
    }

    #[test]
    fn test_puts() {
        let (mut vm, buf) = fresh_vm();
        call(&mut vm, 0x61, vec![Value::Str("line".into())]);
        assert_eq!(buf.contents(), "line\n");
    }

    // ── strings and lengths ──────────────────────────────────────────

    #[test]
    fn test_len_variants() {
        let (mut vm, _) = fresh_vm();
        assert_eq!(
            call(&mut vm, 0x63, vec![Value::Str("héllo".into())]),
            Some(Value::Int(5))
        );
        assert_eq!(
            call(&mut vm, 0x63, vec![Value::list(vec![Value::Int(1), Value::Int(2)])]),
            Some(Value::Int(2))
        );
    }

    #[test]
    fn test_strlen_through_memory() {
        let (mut vm, _) = fresh_vm();
        for (i, b) in b"abc\0".iter().enumerate() {
            vm.memory.store_int(i as i64, 1, *b as i64).unwrap();
        }
        assert_eq!(call(&mut vm, 0x62, vec![Value::Int(0)]), Some(Value::Int(3)));
    }

    #[test]
    fn test_string_methods() {
        let (mut vm, _) = fresh_vm();
        let s = Value::Str("  Hello World  ".into());
        assert_eq!(
            call_method(&mut vm, 0xA7, s, vec![]),
            Some(Value::Str("Hello World".into()))
        );
        assert_eq!(
            call_method(&mut vm, 0xA0, Value::Str("AbC".into()), vec![]),
            Some(Value::Str("abc".into()))
        );
        assert_eq!(
            call_method(&mut vm, 0xA1, Value::Str("AbC".into()), vec![]),
            Some(Value::Str("ABC".into()))
        );
        assert_eq!(
            call_method(
                &mut vm,
                0xA4,
                Value::Str("a-b-c".into()),
                vec![Value::Str("-".into()), Value::Str("+".into())]
            ),
            Some(Value::Str("a+b+c".into()))
        );
        assert_eq!(
            call_method(&mut vm, 0xA5, Value::Str("hello".into()), vec![Value::Str("llo".into())]),
            Some(Value::Int(2))
        );
        assert_eq!(
            call_method(&mut vm, 0xA6, Value::Str("hello".into()), vec![Value::Str("he".into())]),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn test_split_and_join() {
        let (mut vm, _) = fresh_vm();
        let parts = call_method(
            &mut vm,
            0xA2,
            Value::Str("a,b,c".into()),
            vec![Value::Str(",".into())],
        )
        .unwrap();
        let joined = call_method(&mut vm, 0xA3, Value::Str("-".into()), vec![parts]).unwrap();
        assert_eq!(joined, Value::Str("a-b-c".into()));
    }

    // ── collections ──────────────────────────────────────────────────

    #[test]
    fn test_set_constructor_dedupes() {
        let (mut vm, _) = fresh_vm();
        let source = Value::list(vec![Value::Int(1), Value::Int(1), Value::Int(2)]);
        let set = call(&mut vm, 0x90, vec![source]).unwrap();
        match set {
            Value::Set(items) => assert_eq!(items.borrow().len(), 2),
            other => panic!("expected set, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_list_methods_front_back_insert_erase() {
        let (mut vm, _) = fresh_vm();
        let list = Value::list(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(
            call_method(&mut vm, 0xA9, list.clone(), vec![]),
            Some(Value::Int(1))
        );
        assert_eq!(
            call_method(&mut vm, 0xAA, list.clone(), vec![]),
            Some(Value::Int(3))
        );
        call_method(&mut vm, 0xB6, list.clone(), vec![Value::Int(1), Value::Int(2)]);
        assert!(list.loose_eq(&Value::list(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3)
        ])));
        call_method(&mut vm, 0xB7, list.clone(), vec![Value::Int(0)]);
        assert!(list.loose_eq(&Value::list(vec![Value::Int(2), Value::Int(3)])));
    }

    #[test]
    fn test_list_sort_unique_reverse() {
        let (mut vm, _) = fresh_vm();
        let list = Value::list(vec![
            Value::Int(3),
            Value::Int(1),
            Value::Int(1),
            Value::Int(2),
        ]);
        call_method(&mut vm, 0xBD, list.clone(), vec![]);
        call_method(&mut vm, 0xBE, list.clone(), vec![]);
        call_method(&mut vm, 0xBF, list.clone(), vec![]);
        assert!(list.loose_eq(&Value::list(vec![
            Value::Int(3),
            Value::Int(2),
            Value::Int(1)
        ])));
    }

    #[test]
    fn test_list_swap_and_equals() {
        let (mut vm, _) = fresh_vm();
        let a = Value::list(vec![Value::Int(1)]);
        let b = Value::list(vec![Value::Int(2)]);
        call_method(&mut vm, 0xBC, a.clone(), vec![b.clone()]);
        assert!(a.loose_eq(&Value::list(vec![Value::Int(2)])));
        assert!(b.loose_eq(&Value::list(vec![Value::Int(1)])));
        assert_eq!(
            call_method(&mut vm, 0xC7, a, vec![Value::list(vec![Value::Int(2)])]),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn test_max_size_and_sentinels() {
        let (mut vm, _) = fresh_vm();
        let list = Value::list(vec![]);
        assert_eq!(
            call_method(&mut vm, 0xB4, list.clone(), vec![]),
            Some(Value::Int(i32::MAX))
        );
        assert_eq!(call_method(&mut vm, 0xAB, list.clone(), vec![]), Some(Value::Int(0)));
        assert_eq!(call_method(&mut vm, 0xAC, list, vec![]), Some(Value::Int(0)));
    }

    #[test]
    fn test_reversed_copy() {
        let (mut vm, _) = fresh_vm();
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let reversed = call(&mut vm, 0xC9, vec![list.clone()]).unwrap();
        assert!(reversed.loose_eq(&Value::list(vec![Value::Int(2), Value::Int(1)])));
        assert!(list.loose_eq(&Value::list(vec![Value::Int(1), Value::Int(2)])));
    }

    // ── math and builtins ────────────────────────────────────────────

    #[test]
    fn test_math_family() {
        let (mut vm, _) = fresh_vm();
        assert_eq!(call(&mut vm, 0xB0, vec![Value::Int(9)]), Some(Value::Float(3.0)));
        assert_eq!(call(&mut vm, 0xB1, vec![Value::Int(-4)]), Some(Value::Int(4)));
        match call(&mut vm, 0xB2, vec![]) {
            Some(Value::Float(pi)) => assert!((pi - std::f64::consts::PI).abs() < 1e-12),
            other => panic!("expected pi, got {:?}", other),
        }
    }

    #[test]
    fn test_range_forms() {
        let (mut vm, _) = fresh_vm();
        let r = call(&mut vm, 0xE8, vec![Value::Int(3)]).unwrap();
        assert!(r.loose_eq(&Value::list(vec![Value::Int(0), Value::Int(1), Value::Int(2)])));
        let r = call(&mut vm, 0xE8, vec![Value::Int(5), Value::Int(1), Value::Int(-2)]).unwrap();
        assert!(r.loose_eq(&Value::list(vec![Value::Int(5), Value::Int(3)])));
    }

    #[test]
    fn test_min_max_sum_sorted() {
        let (mut vm, _) = fresh_vm();
        let list = Value::list(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert_eq!(call(&mut vm, 0xE9, vec![list.clone()]), Some(Value::Int(1)));
        assert_eq!(call(&mut vm, 0xEA, vec![list.clone()]), Some(Value::Int(3)));
        assert_eq!(call(&mut vm, 0xEB, vec![list.clone()]), Some(Value::Int(6)));
        let sorted = call(&mut vm, 0xEC, vec![list]).unwrap();
        assert!(sorted.loose_eq(&Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)])));
    }

    #[test]
    fn test_int_float_str_bool() {
        let (mut vm, _) = fresh_vm();
        assert_eq!(
            call(&mut vm, 0xED, vec![Value::Str("42".into())]),
            Some(Value::Int(42))
        );
        assert_eq!(
            call(&mut vm, 0xED, vec![Value::Str("ff".into()), Value::Int(16)]),
            Some(Value::Int(255))
        );
        assert_eq!(
            call(&mut vm, 0xEE, vec![Value::Str("2.5".into())]),
            Some(Value::Float(2.5))
        );
        assert_eq!(
            call(&mut vm, 0xEF, vec![Value::Int(7)]),
            Some(Value::Str("7".into()))
        );
        assert_eq!(call(&mut vm, 0xF0, vec![Value::Int(0)]), Some(Value::Int(0)));
    }

    #[test]
    fn test_chr_ord_radix_repr() {
        let (mut vm, _) = fresh_vm();
        assert_eq!(call(&mut vm, 0xF2, vec![Value::Int(65)]), Some(Value::Str("A".into())));
        assert_eq!(call(&mut vm, 0xF3, vec![Value::Str("A".into())]), Some(Value::Int(65)));
        assert_eq!(call(&mut vm, 0xFA, vec![Value::Int(5)]), Some(Value::Str("0b101".into())));
        assert_eq!(call(&mut vm, 0xFB, vec![Value::Int(255)]), Some(Value::Str("0xff".into())));
        assert_eq!(call(&mut vm, 0xFC, vec![Value::Int(8)]), Some(Value::Str("0o10".into())));
        assert_eq!(
            call(&mut vm, 0xF9, vec![Value::Str("x".into())]),
            Some(Value::Str("\"x\"".into()))
        );
    }

    #[test]
    fn test_divmod_floor_semantics() {
        let (mut vm, _) = fresh_vm();
        let r = call(&mut vm, 0xF5, vec![Value::Int(-7), Value::Int(2)]).unwrap();
        assert!(r.loose_eq(&Value::list(vec![Value::Int(-4), Value::Int(1)])));
    }

    #[test]
    fn test_pow_with_modulus() {
        let (mut vm, _) = fresh_vm();
        assert_eq!(
            call(&mut vm, 0xF6, vec![Value::Int(2), Value::Int(10)]),
            Some(Value::Int(1024))
        );
        assert_eq!(
            call(&mut vm, 0xF6, vec![Value::Int(3), Value::Int(4), Value::Int(5)]),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn test_zip_enumerate() {
        let (mut vm, _) = fresh_vm();
        let a = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::list(vec![Value::Str("x".into())]);
        let zipped = call(&mut vm, 0xFE, vec![a.clone(), b]).unwrap();
        assert!(zipped.loose_eq(&Value::list(vec![Value::list(vec![
            Value::Int(1),
            Value::Str("x".into())
        ])])));

        let enumerated = call(&mut vm, 0xFF, vec![a, Value::Int(10)]).unwrap();
        assert!(enumerated.loose_eq(&Value::list(vec![
            Value::list(vec![Value::Int(10), Value::Int(1)]),
            Value::list(vec![Value::Int(11), Value::Int(2)]),
        ])));
    }

    // ── C conversions ────────────────────────────────────────────────

    #[test]
    fn test_atoi_and_friends() {
        let (mut vm, _) = fresh_vm();
        assert_eq!(
            call(&mut vm, 0xD5, vec![Value::Str("  -42abc".into())]),
            Some(Value::Int(-42))
        );
        assert_eq!(
            call(&mut vm, 0xD4, vec![Value::Str("3.5x".into())]),
            Some(Value::Float(3.5))
        );
        assert_eq!(
            call(&mut vm, 0xDA, vec![Value::Str("0x1f".into()), Value::Int(0), Value::Int(16)]),
            Some(Value::Long(31))
        );
    }

    // ── memory syscalls ──────────────────────────────────────────────

    #[test]
    fn test_calloc_zeroes() {
        let (mut vm, _) = fresh_vm();
        let addr = call(&mut vm, 0xD1, vec![Value::Int(4), Value::Int(4)])
            .unwrap()
            .coerce_i64();
        assert!(addr > 0);
        assert_eq!(vm.memory.load_int(addr, 4).unwrap(), 0);
    }

    #[test]
    fn test_realloc_preserves_prefix() {
        let (mut vm, _) = fresh_vm();
        let addr = call(&mut vm, 0xD0, vec![Value::Int(8)]).unwrap().coerce_i64();
        vm.memory.store_int(addr, 4, 0x1234).unwrap();
        let bigger = call(&mut vm, 0xD2, vec![Value::Int(addr as i32), Value::Int(32)])
            .unwrap()
            .coerce_i64();
        assert_eq!(vm.memory.load_int(bigger, 4).unwrap(), 0x1234);
    }

    // ── process and env ──────────────────────────────────────────────

    #[test]
    fn test_exit_code_from_source() {
        let (_, exit, _) = run_source("exit(3)\n");
        assert_eq!(exit, 3);
    }

    #[test]
    fn test_atexit_runs_in_reverse_order() {
        let (out, _, _) = run_source(
            "def first():\n    print(\"first\")\ndef second():\n    print(\"second\")\natexit(first)\natexit(second)\nprint(\"main\")\n",
        );
        assert_eq!(out, "main\nsecond\nfirst\n");
    }

    #[test]
    fn test_getenv() {
        std::env::set_var("SOUL_TEST_VAR", "value123");
        let (mut vm, _) = fresh_vm();
        assert_eq!(
            call(&mut vm, 0xE5, vec![Value::Str("SOUL_TEST_VAR".into())]),
            Some(Value::Str("value123".into()))
        );
        assert_eq!(
            call(&mut vm, 0xE5, vec![Value::Str("SOUL_MISSING_VAR".into())]),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_unknown_syscall_is_tolerated() {
        let (mut vm, _) = fresh_vm();
        vm.push(Value::Int(0)).unwrap();
        assert!(dispatch(&mut vm, 0x4F).is_ok());
    }

    // ── guest comparators ────────────────────────────────────────────

    #[test]
    fn test_qsort_with_guest_comparator() {
        let (out, _, _) = run_source(
            "def cmp(a, b):\n    return a - b\nxs = [3, 1, 2]\nqsort(xs, cmp)\nprint(xs)\n",
        );
        assert_eq!(out, "[1, 2, 3]\n");
    }

    #[test]
    fn test_bsearch_with_guest_comparator() {
        let (out, _, _) = run_source(
            "def cmp(a, b):\n    return a - b\nxs = [10, 20, 30, 40]\nprint(bsearch(30, xs, cmp))\n",
        );
        assert_eq!(out, "2\n");
    }

    #[test]
    fn test_remove_if_with_guest_predicate() {
        let (out, _, _) = run_source(
            "def odd(n):\n    return n % 2\nxs = [1, 2, 3, 4]\nxs.remove_if(odd)\nprint(xs)\n",
        );
        assert_eq!(out, "[2, 4]\n");
    }

    // ── files end to end ─────────────────────────────────────────────

    #[test]
    fn test_fopen_fprintf_fclose_roundtrip() {
        let (_, _, vm) = run_source(
            "f = fopen(\"out.txt\", \"w\")\nfprintf(f, \"n=%d\\n\", 7)\nfclose(f)\n",
        );
        assert_eq!(vm.vfs.contents("out.txt").unwrap(), b"n=7\n".to_vec());
    }

    #[test]
    fn test_fopen_missing_read_returns_zero() {
        let (out, _, _) = run_source("f = fopen(\"absent.txt\", \"r\")\nprint(f)\n");
        assert_eq!(out, "0\n");
    }
}

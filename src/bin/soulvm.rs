use std::{env, fs, process};

use soul::bytecode::loader::Loader;
use soul::runtime::vm::{Vm, VmConfig};

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        return;
    }

    let mut config = VmConfig {
        ramfs: args.contains(&"--ramfs".to_string()),
        debug: args.contains(&"--debug".to_string()),
        validate: !args.contains(&"--no-validate".to_string()),
        ..VmConfig::default()
    };

    let mut input: Option<String> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--max-memory" => {
                i += 1;
                if let Some(n) = args.get(i).and_then(|s| s.parse().ok()) {
                    config.max_memory = n;
                }
            }
            "--stack-size" => {
                i += 1;
                if let Some(n) = args.get(i).and_then(|s| s.parse().ok()) {
                    config.stack_size = n;
                }
            }
            flag if flag.starts_with('-') => {}
            positional => {
                if input.is_none() {
                    input = Some(positional.to_string());
                }
            }
        }
        i += 1;
    }

    let Some(input) = input else {
        print_usage();
        process::exit(1);
    };

    let image = match fs::read(&input) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", input, e);
            process::exit(1);
        }
    };

    let code = match Loader::load(&image, config.validate) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Load Error: {}", e);
            process::exit(1);
        }
    };

    let mut vm = Vm::new(code, config);
    match vm.run() {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("Runtime Error: {}", e);
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("soulvm - Soul Polyglot bytecode VM");
    println!();
    println!("Usage:");
    println!("  soulvm [options] <file.casm>");
    println!();
    println!("Options:");
    println!("  --ramfs           Force the in-memory filesystem");
    println!("  --debug           Enable traces and error records");
    println!("  --no-validate     Skip the load-time opcode scan");
    println!("  --max-memory N    Linear memory size in bytes");
    println!("  --stack-size N    Operand stack capacity");
    println!("  --help, -h        Show this help");
}

use std::{env, fs, path::Path, process};

use soul::bytecode::compiler::Compiler;
use soul::bytecode::disasm::print_bc;
use soul::bytecode::MAGIC;
use soul::frontend::lexer::Lexer;
use soul::frontend::preprocessor::Preprocessor;
use soul::frontend::token_dumper::TokenDumper;

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    let verbose = args.contains(&"-v".to_string());
    let tokens_only = args.contains(&"--tokens".to_string());
    let no_color = args.contains(&"--no-color".to_string());
    let show_bc = args.contains(&"--bc".to_string());
    let cpp_mode = args.contains(&"--cpp".to_string());
    // Indentation-sensitive lexing is the default; --python forces it on
    // even for .c/.cpp inputs, --cpp forces it off.
    let python_mode = if args.contains(&"--python".to_string()) {
        true
    } else {
        !cpp_mode
    };

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        return;
    }

    // Positional arguments and valued flags.
    let mut input: Option<String> = None;
    let mut output: Option<String> = None;
    let mut include_dirs: Vec<String> = Vec::new();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-o" => {
                i += 1;
                output = args.get(i).cloned();
            }
            "-I" => {
                i += 1;
                if let Some(dir) = args.get(i) {
                    include_dirs.push(dir.clone());
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

    let raw_source = match fs::read_to_string(&input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", input, e);
            process::exit(1);
        }
    };

    let current_dir = Path::new(&input)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let mut preprocessor = Preprocessor::new();
    for dir in include_dirs {
        preprocessor.add_include_path(dir);
    }
    let source = preprocessor.preprocess(&raw_source, &current_dir);

    let mut lexer = Lexer::new(&source, python_mode);
    let tokens = match lexer.tokenize() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Lexer error: {}", e);
            process::exit(1);
        }
    };

    if tokens_only {
        let mut dumper = TokenDumper::new();
        if no_color {
            dumper = dumper.no_color();
        }
        dumper.dump(&tokens);
        return;
    }

    let code = match Compiler::new(tokens).compile() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if show_bc {
        print_bc(&code);
    }

    let output = output.unwrap_or_else(|| default_output(&input));
    let mut image = MAGIC.to_vec();
    image.extend_from_slice(&code);
    if let Err(e) = fs::write(&output, &image) {
        eprintln!("Failed to write '{}': {}", output, e);
        process::exit(1);
    }
    if verbose {
        println!("{} -> {} ({} bytes)", input, output, image.len());
    }
}

/// Default output path: the input with its extension replaced by .casm.
fn default_output(input: &str) -> String {
    let path = Path::new(input);
    path.with_extension("casm").to_string_lossy().into_owned()
}

fn print_usage() {
    println!("soulc - Soul Polyglot compiler");
    println!();
    println!("Usage:");
    println!("  soulc [options] <in> [-o <out>]");
    println!();
    println!("Options:");
    println!("  -o <out>      Output path (default: input with .casm)");
    println!("  -I <dir>      Add an include search directory");
    println!("  --python      Force indentation-sensitive lexing");
    println!("  --cpp         Brace-delimited blocks only");
    println!("  --tokens      Dump tokens and stop");
    println!("  --bc          Print a disassembly of the output");
    println!("  -v            Verbose");
    println!("  --help, -h    Show this help");
}

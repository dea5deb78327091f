use std::env;
use std::fs;
use std::rc::Rc;

use tamarin_eval::eval_program;
use tamarin_object::{Environment, Value, BUILTINS};
use tamarin_parser::{parse, ParseError};
use tamarin_vm::{new_globals_store, Compiler, SymbolTable, Vm};

const REPL_FACE: &str = "@(o.o)@";

fn print_usage() {
    eprintln!("tamarin - a small bytecode-compiled scripting language");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  tamarin                 Start interactive session");
    eprintln!("  tamarin repl            Start interactive session");
    eprintln!("  tamarin <file>          Run a file on the VM");
    eprintln!("  tamarin run <file>      Run a file on the VM");
    eprintln!("  tamarin eval <file>     Run a file on the tree-walking backend");
    eprintln!("  tamarin dis <file>      Compile a file and print its bytecode");
    eprintln!("  tamarin ast <file>      Parse a file and print its AST as JSON");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -h, --help     Show this help message");
    eprintln!("  -V, --version  Show version information");
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        run_repl();
        return;
    }
    match args[1].as_str() {
        "--help" | "-h" => print_usage(),
        "--version" | "-V" => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        "repl" => run_repl(),
        "run" if args.len() > 2 => run_file(&args[2]),
        "eval" if args.len() > 2 => eval_file(&args[2]),
        "dis" if args.len() > 2 => disassemble_file(&args[2]),
        "ast" if args.len() > 2 => dump_ast(&args[2]),
        path if args.len() == 2 && !path.starts_with('-') => run_file(path),
        _ => {
            print_usage();
            std::process::exit(1);
        }
    }
}

fn run_repl() {
    let user = env::var("USER").unwrap_or_else(|_| "there".to_string());
    println!("Hello {user}! This is the Tamarin programming language!");
    println!("Feel free to type in commands");

    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(_) => {
            eprintln!("failed to start line editor");
            return;
        }
    };
    let history_path = env::var("HOME")
        .ok()
        .map(|home| std::path::PathBuf::from(home).join(".tamarin_history"));
    if let Some(path) = history_path.as_ref() {
        let _ = rl.load_history(path);
    }

    // Symbol table, constants pool, and globals survive across lines, so
    // bindings accumulate the way a session expects.
    let mut symbol_table = SymbolTable::new();
    for (index, builtin) in BUILTINS.iter().enumerate() {
        symbol_table.define_builtin(index, builtin.name);
    }
    let mut constants: Vec<Value> = Vec::new();
    let globals = new_globals_store();

    loop {
        let line = match rl.readline(">> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" || trimmed == ".exit" {
            break;
        }
        let _ = rl.add_history_entry(trimmed);

        let (program, errors) = parse(trimmed);
        if !errors.is_empty() {
            print_parser_errors(&errors);
            continue;
        }

        let mut compiler = Compiler::new_with_state(symbol_table, constants);
        let compiled = compiler.compile(&program);
        let bytecode = compiler.bytecode();
        (symbol_table, constants) = compiler.into_state();
        if let Err(err) = compiled {
            println!("Woops! Compilation failed:\n {err}");
            continue;
        }

        let mut vm = Vm::new_with_global_store(bytecode, Rc::clone(&globals));
        if let Err(err) = vm.run() {
            println!("Woops! Executing bytecode failed:\n {err}");
            continue;
        }
        println!("{}", vm.last_popped_stack_elem().inspect());
    }

    if let Some(path) = history_path.as_ref() {
        let _ = rl.append_history(path);
    }
}

fn print_parser_errors(errors: &[ParseError]) {
    println!("{REPL_FACE}");
    println!("Woops! We ran into some trouble here!");
    println!("parser errors:");
    for error in errors {
        println!("\t{error}");
    }
}

fn load_program(path: &str) -> tamarin_syntax::Program {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("could not read {path}: {err}");
            std::process::exit(1);
        }
    };
    let (program, errors) = parse(&source);
    if !errors.is_empty() {
        eprintln!("parser errors in {path}:");
        for error in &errors {
            eprintln!("\t{error}");
        }
        std::process::exit(1);
    }
    program
}

fn compile_program(program: &tamarin_syntax::Program) -> tamarin_vm::Bytecode {
    let mut compiler = Compiler::new();
    if let Err(err) = compiler.compile(program) {
        eprintln!("{err}");
        std::process::exit(1);
    }
    compiler.bytecode()
}

fn run_file(path: &str) {
    let program = load_program(path);
    let bytecode = compile_program(&program);
    let mut vm = Vm::new(bytecode);
    if let Err(err) = vm.run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
    let result = vm.last_popped_stack_elem();
    if result != Value::Null {
        println!("{}", result.inspect());
    }
}

fn eval_file(path: &str) {
    let program = load_program(path);
    let env = Environment::new();
    let result = eval_program(&program, &env);
    if let Value::Error(message) = &result {
        eprintln!("runtime error: {message}");
        std::process::exit(1);
    }
    if result != Value::Null {
        println!("{}", result.inspect());
    }
}

fn disassemble_file(path: &str) {
    let program = load_program(path);
    let bytecode = compile_program(&program);
    println!("== main ==");
    print!("{}", bytecode.instructions);
    for (index, constant) in bytecode.constants.iter().enumerate() {
        match constant {
            Value::CompiledFunction(func) => {
                println!(
                    "== fn {index} (locals: {}, params: {}) ==",
                    func.num_locals, func.num_parameters
                );
                print!("{}", func.instructions);
            }
            other => println!("{index}: {}", other.inspect()),
        }
    }
}

fn dump_ast(path: &str) {
    let program = load_program(path);
    match serde_json::to_string_pretty(&program) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("could not serialize AST: {err}");
            std::process::exit(1);
        }
    }
}

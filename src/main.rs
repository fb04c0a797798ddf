//! Prolotron - logic-programming runtime CLI.
use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process;

use prolotron::engine::Engine;
use prolotron::term::TermDisplay;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("Prolotron v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    prolotron [OPTIONS] <PROGRAM>");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help            Print this help message");
    eprintln!("    -v, --version         Print version information");
    eprintln!("    -q, --query <GOAL>    Compile <PROGRAM>, run <GOAL>, print all solutions");
    eprintln!("    -c, --config <FILE>   Load engine resource limits from a TOML manifest");
    eprintln!("    --repl                Start an interactive REPL after loading <PROGRAM>");
    eprintln!();
    eprintln!("ARGUMENTS:");
    eprintln!("    <PROGRAM>             Source file to compile (use '-' for stdin)");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    prolotron facts.pl -q \"p(X)\"");
    eprintln!("    prolotron --repl facts.pl");
    eprintln!("    cat facts.pl | prolotron - -q \"p(1)\"");
}

fn print_version() {
    println!("Prolotron {}", VERSION);
}

struct Options {
    program: Option<String>,
    query: Option<String>,
    config: Option<String>,
    repl_mode: bool,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut program = None;
    let mut query = None;
    let mut config = None;
    let mut repl_mode = false;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                process::exit(0);
            }
            "-q" | "--query" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing goal after -q".to_string());
                }
                query = Some(args[i].clone());
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing file after -c".to_string());
                }
                config = Some(args[i].clone());
            }
            "--repl" => {
                repl_mode = true;
            }
            arg if arg.starts_with('-') && arg != "-" => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => {
                if program.is_some() {
                    return Err("Multiple program files specified".to_string());
                }
                program = Some(arg.to_string());
            }
        }
        i += 1;
    }

    Ok(Options { program, query, config, repl_mode })
}

fn read_input(input: &str) -> Result<String, String> {
    if input == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| format!("Failed to read from stdin: {}", e))?;
        Ok(buffer)
    } else {
        let path = Path::new(input);
        if !path.exists() {
            return Err(format!("Program file not found: {}", input));
        }
        fs::read_to_string(path).map_err(|e| format!("Failed to read file '{}': {}", input, e))
    }
}

fn build_engine(options: &Options) -> Result<Engine, String> {
    match &options.config {
        Some(path) => Engine::from_config_file(path).map_err(|e| e.to_string()),
        None => Ok(Engine::new()),
    }
}

fn format_bindings(engine: &Engine, bindings: &[prolotron::Binding]) -> String {
    if bindings.is_empty() {
        return "true".to_string();
    }
    bindings
        .iter()
        .map(|b| format!("{} = {}", b.name, TermDisplay { term: &b.value, table: engine.symtab() }))
        .collect::<Vec<_>>()
        .join(", ")
}

fn run_query(engine: &mut Engine, goal: &str) -> Result<String, String> {
    let mut output = String::new();
    match engine.first_solution(goal).map_err(|e| e.to_string())? {
        None => output.push_str("false.\n"),
        Some(first) => {
            output.push_str(&format_bindings(engine, &first));
            output.push('\n');
            loop {
                match engine.next_solution().map_err(|e| e.to_string())? {
                    Some(more) => {
                        output.push_str(&format_bindings(engine, &more));
                        output.push('\n');
                    }
                    None => break,
                }
            }
        }
    }
    Ok(output)
}

fn run_repl(engine: &mut Engine) {
    println!("Prolotron REPL v{}", VERSION);
    println!("Enter a program term or `?- Goal.` to query. Type 'exit' or 'quit' to exit.\n");

    let mut line_num = 1;
    loop {
        print!("?- [{}]> ", line_num);
        io::stdout().flush().unwrap();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).unwrap() == 0 {
            break;
        }
        let input = input.trim();

        if input == "exit" || input == "quit" {
            println!("Goodbye!");
            break;
        }
        if input.is_empty() {
            continue;
        }

        let goal = input.strip_prefix("?-").map(str::trim).unwrap_or(input);
        if input.starts_with("?-") {
            match run_query(engine, goal) {
                Ok(out) => print!("{}", out),
                Err(e) => eprintln!("Error: {}", e),
            }
        } else {
            match engine.compile(input) {
                Ok(warnings) => {
                    for w in warnings {
                        eprintln!("% {}", w);
                    }
                }
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        line_num += 1;
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    let mut engine = match build_engine(&options) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if let Some(program) = &options.program {
        let source = match read_input(program) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        };
        match engine.compile(&source) {
            Ok(warnings) => {
                for w in warnings {
                    eprintln!("% {}", w);
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }
    }

    if let Some(goal) = &options.query {
        match run_query(&mut engine, goal) {
            Ok(out) => print!("{}", out),
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }
        if !options.repl_mode {
            return;
        }
    }

    if options.repl_mode {
        run_repl(&mut engine);
        return;
    }

    if options.program.is_none() {
        eprintln!("Error: Missing program file");
        eprintln!();
        print_usage();
        process::exit(1);
    }
}

use std::io::{BufRead, Write};
use std::process::exit;

use clap::Parser;
use flint_core::object::Function;
use flint_vm::{InterpretResult, Vm, VmOptions};

#[derive(clap::Parser)]
#[command(about, version)]
struct Opt {
    /// Script file to run. Without a file or --eval, starts a REPL.
    file: Option<String>,

    /// Evaluate the given string as a Flint program.
    #[arg(short, long)]
    eval: Option<String>,

    /// Only compile the input and print every function's bytecode.
    #[arg(long)]
    dump_bytecode: bool,

    /// Print the stack and each instruction before executing it.
    #[arg(long)]
    trace: bool,

    /// Collect garbage at every allocation safe point.
    #[arg(long)]
    stress_gc: bool,
}

fn main() {
    let opt = Opt::parse();

    tracing_subscriber::FmtSubscriber::builder()
        .without_time()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = VmOptions {
        trace_execution: opt.trace,
        stress_gc: opt.stress_gc,
    };

    let source = if let Some(eval) = opt.eval {
        Some(eval)
    } else if let Some(file) = &opt.file {
        match std::fs::read_to_string(file) {
            Ok(source) => Some(source),
            Err(error) => {
                eprintln!("Could not read {}: {}", file, error);
                exit(74);
            }
        }
    } else {
        None
    };

    let Some(source) = source else {
        repl(options);
        return;
    };

    if opt.dump_bytecode {
        dump_bytecode(&source);
        return;
    }

    let mut vm = Vm::new(options);
    match vm.interpret(&source) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => exit(65),
        InterpretResult::RuntimeError => exit(70),
    }
}

/// Line-by-line loop over one VM, so globals persist between entries.
fn repl(options: VmOptions) {
    let mut vm = Vm::new(options);
    let stdin = std::io::stdin();
    let mut stdin = stdin.lock();
    let mut stdout = std::io::stdout();

    loop {
        let _ = write!(stdout, "> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                vm.interpret(&line);
            }
        }
    }
}

fn dump_bytecode(source: &str) {
    let mut heap = flint_core::Heap::new();
    match flint_codegen::compile(source, &mut heap) {
        Ok(script) => print!("{}", dump_function(&script)),
        Err(errors) => {
            for error in errors {
                eprintln!("{}", error);
            }
            exit(65);
        }
    }
}

/// Disassemble a function and, after it, every function in its constant
/// pool, depth-first.
fn dump_function(function: &Function) -> String {
    let name = match function.name {
        Some(name) => format!("<fn {}>", name.text),
        None => "<script>".to_owned(),
    };
    let mut out = flint_core::debug::disassemble_chunk(&function.chunk, &name);
    for constant in &function.chunk.constants {
        if let Some(nested) = constant.as_obj().and_then(|obj| obj.downcast::<Function>()) {
            out.push('\n');
            out.push_str(&dump_function(&nested));
        }
    }
    out
}

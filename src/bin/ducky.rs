//! ducky CLI tool
//!
//! Runs a virtual machine from a configuration file.
//!
//! Exit codes: 0 normal halt, 1 fatal fault, 2 configuration error,
//! 3 timeout; a guest `HLT n` passes `n` through.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

use ducky::{Error, Machine, MachineConfig, MachineExit};

static SNAPSHOT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_sigusr1(_signal: libc::c_int) {
    if let Some(flag) = SNAPSHOT_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

struct Options {
    config: PathBuf,
    machine_in: Vec<PathBuf>,
    machine_out: Option<PathBuf>,
    overrides: Vec<String>,
    debug: bool,
    profile: bool,
    guest_stdout: bool,
}

fn main() {
    let options = match parse_args(&std::env::args().collect::<Vec<_>>()) {
        Ok(Some(options)) => options,
        Ok(None) => return,
        Err(message) => {
            eprintln!("Error: {}", message);
            process::exit(2);
        }
    };

    let mut builder = env_logger::Builder::from_default_env();
    if options.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    process::exit(run(options));
}

fn print_usage(program: &str) {
    println!(
        r#"ducky - a 32-bit virtual machine

USAGE:
    {} CONFIG [OPTIONS]

ARGS:
    CONFIG                  Machine configuration file (TOML)

OPTIONS:
    --machine-in=FILE       Binary to load at boot (repeatable)
    --machine-out=FILE      Write a snapshot on halt / SIGUSR1 / guest request
    --set=SECTION:KEY=VALUE Override a configuration key (repeatable)
    --debug                 Verbose logging
    --profile               Log a per-opcode execution histogram at exit
    -g                      Route guest TTY output to stdout
    -h, --help              Show this help message
    -V, --version           Show version information

EXAMPLES:
    {} machine.toml --machine-in=guest.bin -g
    {} machine.toml --set=memory:size=131072 --machine-out=state.snap
"#,
        program, program, program
    );
}

fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    if args.len() < 2 {
        print_usage(&args[0]);
        return Ok(None);
    }

    let mut config = None;
    let mut machine_in = Vec::new();
    let mut machine_out = None;
    let mut overrides = Vec::new();
    let mut debug = false;
    let mut profile = false;
    let mut guest_stdout = false;

    for arg in &args[1..] {
        if let Some(value) = arg.strip_prefix("--machine-in=") {
            machine_in.push(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--machine-out=") {
            machine_out = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--set=") {
            overrides.push(value.to_string());
        } else {
            match arg.as_str() {
                "--debug" => debug = true,
                "--profile" => profile = true,
                "-g" => guest_stdout = true,
                "-h" | "--help" => {
                    print_usage(&args[0]);
                    return Ok(None);
                }
                "-V" | "--version" => {
                    println!("ducky {}", env!("CARGO_PKG_VERSION"));
                    return Ok(None);
                }
                other if other.starts_with('-') => {
                    return Err(format!("unknown option: {}", other));
                }
                other => {
                    if config.replace(PathBuf::from(other)).is_some() {
                        return Err("more than one CONFIG argument".to_string());
                    }
                }
            }
        }
    }

    let config = config.ok_or("CONFIG argument is required")?;
    Ok(Some(Options {
        config,
        machine_in,
        machine_out,
        overrides,
        debug,
        profile,
        guest_stdout,
    }))
}

fn run(options: Options) -> i32 {
    let config = match MachineConfig::load(&options.config, &options.overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };

    let mut machine = match Machine::new(config) {
        Ok(machine) => machine,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };

    for path in options.machine_in {
        machine.add_binary_path(path);
    }
    if let Some(path) = options.machine_out.clone() {
        machine.set_snapshot_path(path);
    }
    machine.set_guest_stdout(options.guest_stdout);
    machine.set_interactive(true);
    if options.profile {
        machine.enable_profiling();
    }

    // SIGUSR1 requests a snapshot at the next instruction boundary.
    SNAPSHOT_FLAG.set(machine.snapshot_flag()).ok();
    unsafe {
        libc::signal(libc::SIGUSR1, on_sigusr1 as libc::sighandler_t);
    }

    let result = machine.run();

    if options.profile {
        machine.log_profile();
    }

    match result {
        Ok(MachineExit::Halted(code)) => {
            if options.machine_out.is_some() {
                if let Err(e) = machine.capture().save(options.machine_out.as_deref().unwrap()) {
                    eprintln!("Error: snapshot write failed: {}", e);
                }
            }
            code.min(255) as i32
        }
        Ok(MachineExit::Timeout) => 3,
        Err(e @ Error::Configuration(_)) | Err(e @ Error::ConfigNotFound(_)) => {
            eprintln!("Error: {}", e);
            2
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

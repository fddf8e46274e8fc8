//! The `wisp` command line front-end.

use clap::Parser;
use wisp_vm::{Configuration, RunResult, Vm};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "wisp",
    disable_version_flag = true,
    about = "The Wisp scripting language runtime"
)]
struct Options {
    /// Run the given source string
    #[arg(short = 'c', value_name = "SRC")]
    cmd: Option<String>,

    /// Enable debug logging
    #[arg(short = 'd')]
    debug: bool,

    /// Suppress the REPL banner
    #[arg(short = 'q')]
    quiet: bool,

    /// Print the version and exit
    #[arg(short = 'v')]
    version: bool,

    /// Print the runtime in milliseconds after the script finishes
    #[arg(short = 'm')]
    show_time: bool,

    /// The script to run; without one the REPL starts
    file: Option<String>,

    /// Arguments passed through to the script
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() {
    let options = Options::parse();

    if options.version {
        println!("wisp {VERSION}");
        std::process::exit(RunResult::Success.exit_code());
    }

    let mut builder = env_logger::Builder::from_default_env();
    if options.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let mut config = Configuration::default();
    config.use_ansi_escape = std::io::IsTerminal::is_terminal(&std::io::stderr());
    config.arguments = options.args.clone();

    let mut vm = Vm::new(Some(config));

    let result = if let Some(source) = &options.cmd {
        vm.run_string(source)
    } else if let Some(file) = &options.file {
        vm.run_file(file)
    } else {
        if !options.quiet {
            println!("wisp {VERSION} (type your code below)");
        }
        vm.run_repl()
    };

    if options.show_time {
        eprintln!("runtime: {:.3}ms", vm.time());
    }

    std::process::exit(result.exit_code());
}

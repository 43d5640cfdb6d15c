//! Command-line entry point: count every instruction a program retires.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use icount::format::OutputFormat;
use icount::Architecture;

/// Run a target program under instrumentation and print the number of
/// instructions it retired.
#[derive(Debug, Parser)]
#[command(name = "icount", version, about)]
struct Cli {
    /// Target program to run under instrumentation
    target: PathBuf,

    /// Arguments passed through to the target
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    target_args: Vec<OsString>,

    /// Target ISA; detected from the binary when omitted
    #[arg(long, value_enum)]
    arch: Option<Architecture>,

    /// Report format written to stdout
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn run(cli: Cli) -> anyhow::Result<()> {
    use anyhow::Context;
    use icount::engine::ptrace::PtraceEngine;
    use icount::session::{Handler, SessionController};
    use icount::{loader, EventClass};

    let architecture = match cli.arch {
        Some(arch) => arch,
        None => {
            loader::inspect_file(&cli.target)
                .with_context(|| format!("cannot inspect {}", cli.target.display()))?
                .architecture
        }
    };

    let mut controller = SessionController::new(PtraceEngine::new(), &cli.target);
    controller.target_args(cli.target_args);
    controller.configure(architecture)?;

    controller.register_callback(
        EventClass::BeforeInstruction,
        Handler::instruction(|session, _event| session.record_instruction()),
    )?;

    let formatter = cli.format.formatter();
    controller.register_callback(
        EventClass::OnExit,
        Handler::exit(move |session| match formatter.format(session) {
            Ok(report) => println!("{}", report),
            Err(err) => log::error!("cannot format report: {}", err),
        }),
    )?;

    let report = controller.start()?;
    log::info!(
        "{}: {} instructions, target {}",
        report.target.display(),
        report.instructions,
        report.exit
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_cli: Cli) -> anyhow::Result<()> {
    anyhow::bail!("running a target under instrumentation requires Linux ptrace")
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    // stdout carries only the report; all logging goes to stderr.
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S)} {({l}):5.5} {m}{n}",
        )))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .expect("valid logging config");

    log4rs::init_config(config).expect("logging initialized once");
}

//! hlpatch: apply patch plugins to a HashLink bytecode module
//!
//! Reads a module, resolves it, runs each patch plugin in order and writes
//! the result. In raw mode patches edit the structural module, which is
//! written back as is. Otherwise patches edit the resolved graph, which is
//! rebuilt into a fresh module before writing.

mod output;
mod plugin;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hlpatch_bytecode::patch::{apply_patch, PatchOutcome};
use hlpatch_bytecode::{verify_module, ExecutionStrategy, Graph, Module, PatchMode};
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use output::{resolve_color_choice, ColorWhen, StyledOutput};
use plugin::LoadedPatch;

#[derive(Parser, Debug)]
#[command(name = "hlpatch")]
#[command(about = "Apply bytecode patches to a HashLink module", long_about = None)]
#[command(version)]
#[command(after_help = "Example: hlpatch -r --patch libpatch1.so -p \"./patches here/libpatch2.so\" hlboot.dat out/hlboot.dat")]
struct Cli {
    /// Patch the structural module instead of the resolved graph
    #[arg(short, long)]
    raw: bool,

    /// Patch library to apply; repeat for several, applied in order
    #[arg(short, long = "patch", value_name = "LIB")]
    patches: Vec<PathBuf>,

    /// Run everything on one thread
    #[arg(short, long)]
    sequential: bool,

    /// Log per-function progress
    #[arg(short, long)]
    verbose: bool,

    /// When to use colors
    #[arg(long, value_enum, default_value_t = ColorWhen::Auto)]
    color: ColorWhen,

    /// Bytecode file to patch
    input: PathBuf,

    /// Where to write the patched bytecode
    output: PathBuf,
}

impl Cli {
    fn mode(&self) -> PatchMode {
        if self.raw {
            PatchMode::Raw
        } else {
            PatchMode::Resolved
        }
    }

    fn strategy(&self) -> ExecutionStrategy {
        if self.sequential {
            ExecutionStrategy::Sequential
        } else {
            ExecutionStrategy::default()
        }
    }
}

fn init_tracing(verbose: bool, ansi: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .init();
}

fn run(cli: &Cli, out: &mut StyledOutput) -> anyhow::Result<()> {
    let mode = cli.mode();
    let strategy = cli.strategy();
    debug!(?mode, ?strategy, "starting");

    out.title("Reading bytecode");
    let mut module = Module::from_file(&cli.input)
        .with_context(|| format!("cannot read {}", cli.input.display()))?;

    out.title("Parsing bytecode");
    let mut graph = Graph::build(&module, strategy).context("cannot resolve bytecode")?;

    for path in &cli.patches {
        let source = path.display().to_string();
        out.title(&format!("Applying patch {}", source));

        let loaded = match LoadedPatch::load(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(patch = %source, "{}", e);
                out.warning("Patch has not been applied");
                continue;
            }
        };
        out.detail(&loaded.patch().info().to_string());

        match apply_patch(&source, loaded.patch(), mode, &mut module, &mut graph) {
            PatchOutcome::Applied => {}
            PatchOutcome::Reported { errors } => {
                warn!(patch = %source, errors, "patch reported errors")
            }
            PatchOutcome::RolledBack(e) => {
                out.warning(&format!("Patch has not been applied: {}", e));
            }
        }
    }

    let patched = match mode {
        PatchMode::Raw => {
            verify_module(&module).context("patched bytecode is inconsistent")?;
            module
        }
        PatchMode::Resolved => {
            out.title("Constructing patched bytecode");
            graph
                .rebuild(strategy)
                .context("cannot construct patched bytecode")?
        }
    };

    patched
        .write_to_file(&cli.output)
        .with_context(|| format!("cannot write {}", cli.output.display()))?;
    out.success(&format!("Patched bytecode written to {}", cli.output.display()));
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let choice = resolve_color_choice(cli.color);
    init_tracing(cli.verbose, choice != termcolor::ColorChoice::Never);

    let mut out = StyledOutput::new(choice);
    let result = run(&cli, &mut out);
    out.flush();

    if let Err(e) = result {
        out.stderr_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand};
use log::debug;

use xmlsilo::{
  Builder, BuilderFixup, BuilderNode, BuilderSource, CompileFlags, Error, ExportFlags,
  LoadFlags, Silo, SourceFlags,
};

#[derive(Debug, Parser)]
#[clap(author, version, about = "Compile and query binary XML silos", long_about = None)]
struct Args {
  /// Show extra debugging information
  #[clap(short, long, global = true)]
  verbose: bool,
  /// Skip the magic and version checks when loading
  #[clap(long, global = true)]
  force: bool,
  /// Block afterwards until the loaded silo is invalidated
  #[clap(long, global = true)]
  wait: bool,
  /// Print per-operation profiling data
  #[clap(long, global = true)]
  profile: bool,
  /// Pre-tokenize the named elements during compile
  #[clap(long, global = true, value_name = "ELEMENT")]
  tokenize: Vec<String>,
  #[clap(subcommand)]
  command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
  /// Print the internal structure of a silo
  Dump {
    /// Silo file, e.g. example.xmlb
    file: PathBuf,
  },
  /// Emit the silo back as XML
  Export {
    /// Silo file, e.g. example.xmlb
    file: PathBuf,
  },
  /// Execute an XPath query and print each result as XML
  Query {
    /// Silo file, e.g. example.xmlb
    file: PathBuf,
    /// XPath, e.g. components/component[@type='desktop']/id
    xpath: String,
    /// Maximum number of results, 0 for all
    limit: Option<usize>,
  },
  /// Execute XPath queries read from files
  QueryFile {
    /// Silo file, e.g. example.xmlb
    file: PathBuf,
    /// Files holding one XPath each
    #[clap(required = true)]
    xpaths: Vec<PathBuf>,
  },
  /// Compile XML files into a silo
  Compile {
    /// Output file, e.g. example.xmlb
    out: PathBuf,
    /// Input XML files
    #[clap(required = true)]
    inputs: Vec<PathBuf>,
  },
}

fn load_flags(args: &Args) -> LoadFlags {
  if args.force {
    LoadFlags::NO_MAGIC
  } else {
    LoadFlags::empty()
  }
}

fn print_results(silo: &std::sync::Arc<Silo>, xpath: &str, limit: usize) -> Result<(), Error> {
  let results = silo.query(xpath, limit)?;
  for node in results {
    println!("RESULT: {}", node.export(ExportFlags::empty())?);
  }
  Ok(())
}

/// Blocks until the silo file changes on disk, then invalidates the silo.
/// The library itself does no file monitoring, so the tool polls the mtime
/// as the external invalidation signal.
fn wait_for_invalidation(silo: &Silo, path: &Path) -> Result<(), Error> {
  let initial = fs_mtime(path);
  silo.add_validity_observer(Box::new(|valid| {
    debug!("silo validity changed to {}", valid);
  }));
  println!("waiting for invalidation…");
  loop {
    std::thread::sleep(Duration::from_millis(500));
    if fs_mtime(path) != initial {
      silo.invalidate();
      println!("invalidated");
      return Ok(());
    }
  }
}

fn fs_mtime(path: &Path) -> SystemTime {
  std::fs::metadata(path)
    .and_then(|m| m.modified())
    .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn run(args: &Args) -> Result<(), Error> {
  match &args.command {
    Command::Dump { file } => {
      let silo = Silo::load_from_file(file, load_flags(args))?;
      print!("{}", silo.dump()?);
      if args.wait {
        wait_for_invalidation(&silo, file)?;
      }
    }
    Command::Export { file } => {
      let silo = Silo::load_from_file(file, load_flags(args))?;
      print!("{}", silo.export(ExportFlags::FORMAT_MULTILINE)?);
      if args.wait {
        wait_for_invalidation(&silo, file)?;
      }
    }
    Command::Query { file, xpath, limit } => {
      let silo = Silo::load_from_file(file, load_flags(args))?;
      silo.set_profile(args.profile);
      print_results(&silo, xpath, limit.unwrap_or(0))?;
      if args.profile {
        print!("{}", silo.profile_string());
      }
      if args.wait {
        wait_for_invalidation(&silo, file)?;
      }
    }
    Command::QueryFile { file, xpaths } => {
      let silo = Silo::load_from_file(file, load_flags(args))?;
      silo.set_profile(args.profile);
      for path in xpaths {
        let xpath = std::fs::read_to_string(path).map_err(Error::Io)?;
        print_results(&silo, xpath.trim(), 0)?;
      }
      if args.profile {
        print!("{}", silo.profile_string());
      }
    }
    Command::Compile { out, inputs } => {
      let mut builder = Builder::new();
      if !args.tokenize.is_empty() {
        let elements = args.tokenize.clone();
        let mut fixup = BuilderFixup::new(
          "cli-tokenize",
          Box::new(move |bn: &BuilderNode| {
            if let Some(element) = bn.element() {
              if elements.iter().any(|e| *e == element) {
                bn.tokenize_text();
              }
            }
            Ok(())
          }),
        );
        fixup.set_max_depth(-1);
        builder.add_fixup(fixup);
      }
      for input in inputs {
        builder.import_source(BuilderSource::from_file(input, SourceFlags::empty())?);
      }
      let silo = builder.ensure(out, CompileFlags::empty(), None)?;
      debug!("compiled {} with GUID {}", out.display(), silo.guid());
    }
  }
  Ok(())
}

fn main() {
  let args = Args::parse();
  env_logger::Builder::from_env(
    env_logger::Env::default()
      .default_filter_or(if args.verbose { "debug" } else { "warn" }),
  )
  .init();
  if let Err(e) = run(&args) {
    eprintln!("{}", e);
    exit(1);
  }
}

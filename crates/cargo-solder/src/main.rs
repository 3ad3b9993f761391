// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A cargo subcommand running the solder dependency-injection code
//! generator.
//!
//! # Usage
//!
//! ```bash
//! cargo solder gen ...
//! cargo solder check ...
//! cargo solder show ...
//! cargo solder cache dir
//! cargo solder cache clear
//! ```
//!
//! Exit codes: 0 on success, 1 when generation reported failures, 2 on
//! infrastructure errors (I/O, bad flags).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use solder_gen::{Ctx, GenerateOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cargo-solder",
    bin_name = "cargo",
    version,
    about = "Compile-time dependency-injection code generator"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Option<CargoCommand>,
}

#[derive(Subcommand, Debug)]
enum CargoCommand {
    /// Invoked as `cargo solder …`.
    #[command(name = "solder")]
    Solder(SolderArgs),
}

#[derive(Parser, Debug)]
#[command(name = "cargo-solder", version, about = "Compile-time dependency-injection code generator")]
struct SolderArgs {
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the solder_gen.rs file for each matched package.
    Gen(GenArgs),
    /// Parse and resolve without writing anything.
    Check(CheckArgs),
    /// Print the provider sets and injectors found.
    Show(CheckArgs),
    /// Inspect or clear the generation cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Args, Debug)]
struct GenArgs {
    /// Package patterns; a trailing `...` walks the subtree. Defaults to `.`.
    patterns: Vec<String>,
    /// File inserted verbatim as a header in generated output.
    #[arg(long)]
    header_file: Option<PathBuf>,
    /// String prepended to output file names.
    #[arg(long)]
    output_file_prefix: Option<String>,
    /// Extra build tags widening the default solderinject tag.
    #[arg(long)]
    tags: Option<String>,
    /// Log timing information for major steps.
    #[arg(long)]
    timings: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Package patterns; a trailing `...` walks the subtree. Defaults to `.`.
    patterns: Vec<String>,
    /// Extra build tags widening the default solderinject tag.
    #[arg(long)]
    tags: Option<String>,
    /// Log timing information for major steps.
    #[arg(long)]
    timings: bool,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Print the cache directory.
    Dir,
    /// Remove all cached data.
    Clear,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Works both as `cargo solder …` and as a direct `cargo-solder …`
    // invocation.
    let invoked_via_cargo = std::env::args().nth(1).as_deref() == Some("solder");
    let cmd = if invoked_via_cargo {
        match Cli::try_parse() {
            Ok(Cli {
                cmd: Some(CargoCommand::Solder(args)),
            }) => args.cmd,
            Ok(Cli { cmd: None }) => None,
            Err(e) => {
                e.print().ok();
                std::process::exit(2);
            }
        }
    } else {
        match SolderArgs::try_parse() {
            Ok(args) => args.cmd,
            Err(e) => {
                e.print().ok();
                std::process::exit(2);
            }
        }
    };
    let cmd = cmd.unwrap_or(Command::Gen(GenArgs {
        patterns: Vec::new(),
        header_file: None,
        output_file_prefix: None,
        tags: None,
        timings: false,
    }));

    let code = match run(cmd) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("solder: {e:#}");
            2
        }
    };
    std::process::exit(code);
}

fn run(cmd: Command) -> Result<i32> {
    match cmd {
        Command::Gen(args) => run_gen(args),
        Command::Check(args) => run_check(args),
        Command::Show(args) => run_show(args),
        Command::Cache { action } => run_cache(action),
    }
}

fn new_ctx(timings: bool) -> Ctx {
    let ctx = Ctx::new();
    if timings {
        ctx.with_timing(|label: &str, dur: Duration| {
            eprintln!("solder: timing: {label}={dur:?}");
        })
    } else {
        ctx
    }
}

fn environ() -> Vec<String> {
    std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
}

fn run_gen(args: GenArgs) -> Result<i32> {
    let wd = std::env::current_dir().context("failed to get working directory")?;
    let mut opts = GenerateOptions {
        prefix_output_file: args.output_file_prefix.unwrap_or_default(),
        tags: args.tags.unwrap_or_default(),
        ..GenerateOptions::default()
    };
    if let Some(header_file) = &args.header_file {
        opts.header = std::fs::read(header_file)
            .with_context(|| format!("failed to read header file {}", header_file.display()))?;
    }
    let ctx = new_ctx(args.timings);
    let (outs, errs) = solder_gen::generate(&ctx, &wd, &environ(), &args.patterns, &opts);
    if !errs.is_empty() {
        log_errors(&errs);
        eprintln!("solder: generate failed");
        return Ok(1);
    }
    let mut success = true;
    for out in &outs {
        if !out.errs.is_empty() {
            log_errors(&out.errs);
            eprintln!("solder: {}: generate failed", out.pkg_path);
            success = false;
        }
        if out.content.is_empty() {
            // No output; maybe errors, maybe no injectors.
            continue;
        }
        match out.commit() {
            Ok(()) => eprintln!("solder: {}: wrote {}", out.pkg_path, out.output_path.display()),
            Err(e) => {
                eprintln!(
                    "solder: {}: failed to write {}: {e}",
                    out.pkg_path,
                    out.output_path.display()
                );
                success = false;
            }
        }
    }
    if !success {
        eprintln!("solder: at least one generate failure");
        return Ok(1);
    }
    Ok(0)
}

fn run_check(args: CheckArgs) -> Result<i32> {
    let wd = std::env::current_dir().context("failed to get working directory")?;
    let ctx = new_ctx(args.timings);
    let tags = args.tags.unwrap_or_default();
    let (_, errs) = solder_gen::load(&ctx, &wd, &environ(), &tags, &args.patterns);
    if !errs.is_empty() {
        log_errors(&errs);
        return Ok(1);
    }
    Ok(0)
}

fn run_show(args: CheckArgs) -> Result<i32> {
    let wd = std::env::current_dir().context("failed to get working directory")?;
    let ctx = new_ctx(args.timings);
    let tags = args.tags.unwrap_or_default();
    let (info, errs) = solder_gen::load(&ctx, &wd, &environ(), &tags, &args.patterns);
    if let Some(info) = info {
        for ((pkg_path, name), set) in &info.sets {
            println!("{pkg_path}: set {name}");
            for provider in &set.providers {
                println!("  provider {} -> {}", provider.name, provider.out);
            }
            for value in &set.values {
                println!("  value -> {}", value.out);
            }
            for binding in &set.bindings {
                println!("  bind {} -> {}", binding.iface, binding.concrete);
            }
            for (pkg, imported) in &set.imports {
                println!("  import {pkg}::{imported}");
            }
        }
        for injector in &info.injectors {
            println!(
                "{}: injector {} -> {}",
                injector.pkg_path, injector.fn_name, injector.sig.out
            );
        }
    }
    if !errs.is_empty() {
        log_errors(&errs);
        return Ok(1);
    }
    Ok(0)
}

fn run_cache(action: CacheAction) -> Result<i32> {
    match action {
        CacheAction::Dir => {
            println!("{}", solder_gen::cache_dir().display());
            Ok(0)
        }
        CacheAction::Clear => {
            solder_gen::clear_cache().context("failed to clear cache")?;
            Ok(0)
        }
    }
}

fn log_errors(errs: &[solder_gen::Error]) {
    for err in errs {
        eprintln!("solder: {}", err.to_string().replace('\n', "\n\t"));
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cross_builder::audit::{audit, inspect_for_audit, issues_by_object, AuditOptions};
use cross_builder::build::{autobuild, BuildOptions, BuildRequest};
use cross_builder::config::BuilderConfig;
use cross_builder::env::{session_envs, target_envs};
use cross_builder::image::{rewrite_squashfs_uids, ImageProvider};
use cross_builder::object::RecordKind;
use cross_builder::platform::{supported_platforms, Platform};
use cross_builder::preflight::{check_required_tools, missing_fixer_tools, tools_for_images, tools_for_runner};
use cross_builder::runner::{open_session, select_runner_kind, HostCapabilities};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  cross-builder [--config <file>] platforms\n  cross-builder [--config <file>] env <triplet>\n  cross-builder [--config <file>] inspect <file>\n  cross-builder [--config <file>] audit <prefix> <triplet> [--autofix] [--strict] [--json]\n  cross-builder [--config <file>] probe\n  cross-builder [--config <file>] shell <triplet> <workspace>\n  cross-builder [--config <file>] build <build.toml> [--timeout <secs>] [--echo]\n  cross-builder [--config <file>] rewrite-squashfs-uids <image> <uid>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CROSS_BUILDER_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = take_option(&mut args, "--config")?.map(PathBuf::from);
    let load_config = || -> Result<BuilderConfig> {
        let config = BuilderConfig::load_or_default(config_path.as_deref())?;
        config.validate()?;
        Ok(config)
    };

    let command = args.first().cloned().unwrap_or_default();
    match command.as_str() {
        "platforms" if args.len() == 1 => list_platforms(&load_config()?),
        "env" if args.len() == 2 => print_env(&args[1]),
        "inspect" if args.len() == 2 => inspect(Path::new(&args[1])),
        "audit" => {
            let autofix = take_flag(&mut args, "--autofix");
            let strict = take_flag(&mut args, "--strict");
            let json = take_flag(&mut args, "--json");
            match args.as_slice() {
                [_, prefix, triplet] => run_audit(Path::new(prefix), triplet, autofix, strict, json),
                _ => bail!(usage()),
            }
        }
        "probe" if args.len() == 1 => probe(&load_config()?),
        "shell" if args.len() == 3 => shell(&load_config()?, &args[1], Path::new(&args[2])),
        "build" => {
            let timeout = take_option(&mut args, "--timeout")?;
            let echo = take_flag(&mut args, "--echo");
            match args.as_slice() {
                [_, build_file] => build(&load_config()?, Path::new(build_file), timeout, echo),
                _ => bail!(usage()),
            }
        }
        "rewrite-squashfs-uids" if args.len() == 3 => {
            let uid: u32 = args[2]
                .parse()
                .with_context(|| format!("invalid uid '{}'", args[2]))?;
            let rewritten = rewrite_squashfs_uids(Path::new(&args[1]), uid)?;
            println!("rewrote {rewritten} id table entries to {uid}");
            Ok(())
        }
        _ => bail!(usage()),
    }
}

/// Remove `--name` and report whether it was present.
fn take_flag(args: &mut Vec<String>, name: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != name);
    args.len() != before
}

/// Remove `--name <value>` and return the value.
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(index) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    if index + 1 >= args.len() {
        bail!("{name} needs a value");
    }
    let value = args.remove(index + 1);
    args.remove(index);
    Ok(Some(value))
}

fn parse_platform(triplet: &str) -> Result<Platform> {
    triplet
        .parse()
        .with_context(|| format!("parsing target '{triplet}'"))
}

fn list_platforms(config: &BuilderConfig) -> Result<()> {
    let provider = ImageProvider::new(config);
    for platform in supported_platforms() {
        let shard = match provider.shard_for(&platform) {
            Ok(image) => format!("shard {image}"),
            Err(e) => format!("({e})"),
        };
        println!("{:<26} {shard}", platform.to_string());
    }
    Ok(())
}

fn print_env(triplet: &str) -> Result<()> {
    let env = target_envs(triplet).with_context(|| format!("computing environment for '{triplet}'"))?;
    for (key, value) in env {
        println!("{key}={value}");
    }
    Ok(())
}

fn record_kind(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Rpath => "RPATH",
        RecordKind::Runpath => "RUNPATH",
        RecordKind::LcRpath => "LC_RPATH",
    }
}

fn inspect(path: &Path) -> Result<()> {
    let Some(object) = inspect_for_audit(path)? else {
        bail!("{}: not an ELF, Mach-O or PE object", path.display());
    };
    println!("{}", path.display());
    println!("  format:      {}", object.format());
    println!("  machine:     {}", object.machine_type());
    if let Some(soname) = object.soname() {
        println!("  soname:      {soname}");
    }
    if let Some(interp) = object.interpreter() {
        println!("  interpreter: {interp}");
    }
    if let Some(glibc) = object.required_glibc() {
        println!("  needs glibc: {glibc}");
    }
    for dep in object.dependencies() {
        println!("  needed:      {}", dep.name);
    }
    let records = object.existing_relocation_records();
    if records.is_applicable() {
        for record in records.entries() {
            println!("  {:<12} {}", format!("{}:", record_kind(record.kind)), record.path);
        }
    } else {
        println!("  search paths: not applicable");
    }
    Ok(())
}

fn run_audit(prefix: &Path, triplet: &str, autofix: bool, strict: bool, json: bool) -> Result<()> {
    let platform = parse_platform(triplet)?;
    if autofix {
        let missing = missing_fixer_tools();
        if !missing.is_empty() {
            tracing::warn!(tools = ?missing, "rewrites that do not fit in place will fail");
        }
    }
    let mut options = AuditOptions::for_platform(&platform);
    options.autofix = autofix;
    options.strict = strict;
    let report = audit(prefix, &platform, &options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "[audit:{platform}] scanned {} objects under {}",
            report.objects_scanned,
            prefix.display()
        );
        for (object, issues) in issues_by_object(&report.issues) {
            println!("  {}", object.display());
            for issue in issues {
                match &issue.resolved {
                    Some(resolved) => println!(
                        "    {}: {} -> {}",
                        issue.kind,
                        issue.dependency,
                        resolved.display()
                    ),
                    None => println!("    {}: {}", issue.kind, issue.dependency),
                }
            }
        }
        for fixed in &report.fixed {
            println!("  fixed {} ({})", fixed.path.display(), fixed.method);
        }
        for failed in &report.fix_failures {
            println!("  fix failed {}: {}", failed.path.display(), failed.reason);
        }
        for skipped in &report.skipped {
            println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
        }
    }

    if !report.passed(strict) {
        bail!(
            "[audit:{platform}] {} linkage issue(s) remain",
            report.issues.len()
        );
    }
    Ok(())
}

fn probe(config: &BuilderConfig) -> Result<()> {
    let caps = HostCapabilities::probe();
    println!("{}", serde_json::to_string_pretty(&caps)?);
    match config.runner {
        Some(kind) => println!("runner: {kind} (configured)"),
        None => println!("runner: {} (auto)", select_runner_kind(&caps)),
    }
    Ok(())
}

fn preflight(config: &BuilderConfig, platform: &Platform) -> Result<()> {
    check_required_tools(tools_for_images(config.image_strategy))?;
    let provider = ImageProvider::new(config);
    if let (Some(kind), Some(shard_host)) = (config.runner, provider.shard_host(platform)) {
        check_required_tools(&tools_for_runner(kind, &shard_host))?;
    }
    Ok(())
}

fn shell(config: &BuilderConfig, triplet: &str, workspace: &Path) -> Result<()> {
    let platform = parse_platform(triplet)?;
    preflight(config, &platform)?;
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("creating workspace '{}'", workspace.display()))?;

    let env = session_envs(&platform, &BTreeMap::new());
    let mut session = open_session(config, &platform, workspace, &[], &env)
        .with_context(|| format!("opening a sandbox for {platform}"))?;
    println!("[shell:{platform}] {} sandbox, exit the shell to tear it down", session.kind());
    let status = session.shell()?;
    session.close()?;
    if !status.success() {
        bail!("[shell:{platform}] shell ended with {status}");
    }
    Ok(())
}

fn build(config: &BuilderConfig, build_file: &Path, timeout: Option<String>, echo: bool) -> Result<()> {
    let request = BuildRequest::load(build_file)?;
    let timeout = timeout
        .map(|t| t.parse::<u64>().with_context(|| format!("invalid timeout '{t}'")))
        .transpose()?
        .map(Duration::from_secs);

    let platforms = request.target_platforms(config);
    if platforms.is_empty() {
        bail!("build '{}' names no platforms and the image manifest has no shards", request.name);
    }
    for platform in &platforms {
        preflight(config, platform)?;
    }

    println!("[build:{}] building for {} platform(s)...", request.name, platforms.len());
    let outcomes = autobuild(config, &request, &BuildOptions { timeout, echo });

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.error {
            None => println!(
                "[build:{}] {}: ok ({} product(s), log {})",
                request.name,
                outcome.platform,
                outcome.products.len(),
                outcome.dirs.log_path().display()
            ),
            Some(e) => {
                failed += 1;
                println!("[build:{}] {e} (log {})", request.name, outcome.dirs.log_path().display());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} platform build(s) failed", outcomes.len());
    }
    Ok(())
}

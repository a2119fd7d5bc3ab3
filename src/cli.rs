//! Minimal CLI: module | playbook → (tosca | jsonschema)
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use rayon::prelude::*;

use crate::convert::{Conversion, ConvertOptions, convert_module, convert_playbook};
use crate::emit::OutputFormat;
use crate::error::ConvertError;
use crate::extract::{ExtractMode, SpecSource};
use crate::sandbox::SubstitutionEnv;

// ————————————————————————————————————————————————————————————————————————————
// TYPES
// ————————————————————————————————————————————————————————————————————————————

/// convert Ansible module argument specs or playbook variables into TOSCA or JSON Schema
#[derive(Parser, Debug)]
#[command(version)]
pub struct CommandLineInterface {
    /// more logging (-v info, -vv debug); RUST_LOG applies when omitted
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// extract the argument_spec of Ansible modules (.py)
    Module(ModuleOut),
    /// infer parameters from playbook or task-file variables (.yml)
    Playbook(PlaybookOut),
}

#[derive(Args, Debug, Clone)]
struct InputSettings {
    /// One or more inputs. May be literal paths or quoted glob patterns
    #[arg(long, short, num_args = 1.., required = true)]
    input: Vec<String>,

    /// output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Tosca)]
    format: OutputFormat,

    /// node type name (single input only); derived from the file name if omitted
    #[arg(short = 'n', long)]
    node_name: Option<String>,

    /// output file for one input, output directory for many (stdout if omitted with one input)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(clap::Parser, Debug)]
struct ModuleOut {
    #[command(flatten)]
    input_settings: InputSettings,

    /// never run module code; read literal specs only
    #[arg(long)]
    static_only: bool,

    /// debugging
    #[arg(long)]
    no_op: bool,
}

#[derive(clap::Parser, Debug)]
struct PlaybookOut {
    #[command(flatten)]
    input_settings: InputSettings,

    /// debugging
    #[arg(long)]
    no_op: bool,
}

// ————————————————————————————————————————————————————————————————————————————
// IMPLEMENTATION
// ————————————————————————————————————————————————————————————————————————————

impl CommandLineInterface {
    pub fn load() -> Self {
        Self::parse()
    }

    /// Log level requested with `-v`, if any.
    pub fn log_level(&self) -> Option<log::LevelFilter> {
        match self.verbose {
            0 => None,
            1 => Some(log::LevelFilter::Info),
            _ => Some(log::LevelFilter::Debug),
        }
    }

    pub fn run(&self) -> anyhow::Result<()> {
        match &self.cmd {
            Command::Module(target) => {
                // debug path
                if target.no_op {
                    eprintln!("{self:#?}");
                    return Ok(());
                }
                let settings = &target.input_settings;
                let extract_mode = if target.static_only { ExtractMode::StaticOnly } else { ExtractMode::Sandboxed };
                let options = settings.options(extract_mode);
                let env = SubstitutionEnv::default();
                settings.convert_all(|path| convert_module(path, &options, &env))
            }
            Command::Playbook(target) => {
                // debug path
                if target.no_op {
                    eprintln!("{self:#?}");
                    return Ok(());
                }
                let settings = &target.input_settings;
                let options = settings.options(ExtractMode::default());
                settings.convert_all(|path| convert_playbook(path, &options))
            }
        }
    }
}

impl InputSettings {
    fn options(&self, extract_mode: ExtractMode) -> ConvertOptions {
        ConvertOptions { format: self.format, node_type_name: self.node_name.clone(), extract_mode }
    }

    fn convert_all<F>(&self, convert: F) -> anyhow::Result<()>
    where
        F: Fn(&Path) -> Result<Conversion, ConvertError> + Sync,
    {
        let source_paths = resolve_file_path_patterns(&self.input).context("failed to resolve input file paths")?;
        if self.node_name.is_some() && source_paths.len() > 1 {
            bail!("--node-name only applies to a single input ({} given)", source_paths.len());
        }

        if let [source_path] = source_paths.as_slice() {
            let conversion = convert(source_path.as_path())?;
            return match self.out.as_ref() {
                None => {
                    print!("{}", conversion.document);
                    Ok(())
                }
                Some(out) => {
                    let out = if out.is_dir() { self.batch_target(source_path, Some(out.as_path())) } else { out.clone() };
                    write_output(&out, &conversion.document)?;
                    report(source_path, &Ok(conversion), Some(out.as_path()));
                    Ok(())
                }
            };
        }

        let mut claimed = std::collections::HashMap::<PathBuf, &Path>::new();
        for source_path in &source_paths {
            let target = self.batch_target(source_path, self.out.as_deref());
            if let Some(first) = claimed.insert(target.clone(), source_path.as_path()) {
                bail!(
                    "{} and {} would both be written to {}",
                    first.display(),
                    source_path.display(),
                    target.display()
                );
            }
        }

        if let Some(out) = self.out.as_ref() {
            std::fs::create_dir_all(out).with_context(|| format!("failed to create {}", out.display()))?;
        }
        let results: Vec<(PathBuf, anyhow::Result<(Conversion, PathBuf)>)> = source_paths
            .par_iter()
            .map(|source_path| {
                let result = convert(source_path.as_path()).map_err(anyhow::Error::from).and_then(|conversion| {
                    let target = self.batch_target(source_path, self.out.as_deref());
                    write_output(&target, &conversion.document)?;
                    Ok((conversion, target))
                });
                (source_path.clone(), result)
            })
            .collect();

        let mut failures = 0;
        for (source_path, result) in results {
            match result {
                Ok((conversion, target)) => report(&source_path, &Ok(conversion), Some(target.as_path())),
                Err(error) => {
                    failures += 1;
                    report(&source_path, &Err(error), None);
                }
            }
        }
        if failures > 0 {
            bail!("{failures} of {} input(s) failed", source_paths.len());
        }
        Ok(())
    }

    /// `<dir>/<stem>.tosca.yaml`, next to the input when no directory is given.
    fn batch_target(&self, source_path: &Path, out_dir: Option<&Path>) -> PathBuf {
        let stem = source_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let file_name = format!("{stem}.{}", self.format.file_suffix());
        match out_dir {
            Some(dir) => dir.join(file_name),
            None => source_path.with_file_name(file_name),
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERNAL HELPERS
// ————————————————————————————————————————————————————————————————————————————

fn write_output(out: &Path, document: &str) -> anyhow::Result<()> {
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(out, document).with_context(|| format!("failed to write {}", out.display()))
}

fn report(source_path: &Path, result: &anyhow::Result<Conversion>, target: Option<&Path>) {
    let source = source_path.display();
    match result {
        Ok(conversion) => {
            let status = if conversion.miss.is_some() { "empty".yellow() } else { "ok".green() };
            let via = match &conversion.source {
                Some(SpecSource::Dynamic { stand_in }) => format!(" via {stand_in}"),
                Some(SpecSource::Static) => " via static literal".to_string(),
                None => String::new(),
            };
            let target = target.map(|t| format!(" → {}", t.display())).unwrap_or_default();
            eprintln!("{status:>6} {source} ({} parameters{via}){target}", conversion.parameters);
        }
        Err(error) => eprintln!("{:>6} {source}: {error:#}", "error".red().bold()),
    }
}

fn resolve_file_path_patterns<I>(patterns: I) -> anyhow::Result<Vec<PathBuf>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    fn has_glob_chars(s: &str) -> bool {
        // Minimal glob detection for the `glob` crate syntax.
        s.bytes().any(|b| matches!(b, b'*' | b'?' | b'['))
    }

    let mut out = Vec::<PathBuf>::new();

    for raw in patterns {
        let pattern = raw.as_ref();

        if has_glob_chars(pattern) {
            // Treat as a glob pattern
            let mut matched_any = false;
            for entry in glob::glob(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))? {
                out.push(entry?);
                matched_any = true;
            }
            if !matched_any {
                // Pattern was explicitly a glob but matched nothing -> surface as an error
                bail!("glob pattern matched no files: {pattern}");
            }
        } else {
            // Treat as a literal path
            out.push(PathBuf::from(pattern));
        }
    }

    Ok(out)
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_subcommand() {
        let cli = CommandLineInterface::try_parse_from([
            "argspec2tosca", "-vv", "module", "-i", "a.py", "b.py", "-f", "jsonschema", "--static-only",
        ])
        .unwrap();
        assert_eq!(cli.log_level(), Some(log::LevelFilter::Debug));
        let Command::Module(target) = &cli.cmd else { panic!() };
        assert_eq!(target.input_settings.input, ["a.py", "b.py"]);
        assert_eq!(target.input_settings.format, OutputFormat::JsonSchema);
        assert!(target.static_only);
    }

    #[test]
    fn tosca_is_the_default_format() {
        let cli = CommandLineInterface::try_parse_from(["argspec2tosca", "playbook", "-i", "site.yml", "-n", "Site"])
            .unwrap();
        let Command::Playbook(target) = &cli.cmd else { panic!() };
        assert_eq!(target.input_settings.format, OutputFormat::Tosca);
        assert_eq!(target.input_settings.node_name.as_deref(), Some("Site"));
        assert_eq!(cli.log_level(), None);
    }

    #[test]
    fn globs_expand_and_empty_globs_fail() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.py", "b.py", "c.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let pattern = format!("{}/*.py", dir.path().display());
        let paths = resolve_file_path_patterns([pattern]).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(resolve_file_path_patterns([format!("{}/*.rs", dir.path().display())]).is_err());
    }

    #[test]
    fn batch_writes_one_file_per_input() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["one.py", "two.py"] {
            std::fs::write(dir.path().join(name), "argument_spec = dict(x=dict())\n").unwrap();
        }
        let out = dir.path().join("out");
        let cli = CommandLineInterface::try_parse_from([
            "argspec2tosca".to_string(),
            "module".to_string(),
            "-i".to_string(),
            format!("{}/*.py", dir.path().display()),
            "-o".to_string(),
            out.display().to_string(),
        ])
        .unwrap();
        cli.run().unwrap();
        assert!(out.join("one.tosca.yaml").is_file());
        assert!(out.join("two.tosca.yaml").is_file());
    }

    #[test]
    fn batch_refuses_inputs_sharing_an_output_file() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["a", "b"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
            std::fs::write(dir.path().join(sub).join("same.py"), "argument_spec = dict(x=dict())\n").unwrap();
        }
        let out = dir.path().join("out");
        let cli = CommandLineInterface::try_parse_from([
            "argspec2tosca".to_string(),
            "module".to_string(),
            "-i".to_string(),
            format!("{}/*/same.py", dir.path().display()),
            "-o".to_string(),
            out.display().to_string(),
        ])
        .unwrap();
        let err = cli.run().unwrap_err();
        assert!(err.to_string().contains("would both be written to"), "{err:#}");
        assert!(!out.join("same.tosca.yaml").exists());
    }
}

//! Detached jobs: nohup, jobs, attach, rm.
//!
//! A `nohup` command outlives the connection that started it. Its handle is
//! saved as JSON under the platform data directory so a later invocation
//! can reattach through a fresh agent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rcmd::CmdMaster;

use crate::call::{CallArgs, print_value, report, write_output};
use crate::{ConnectArgs, OutputFormat};

/// Arguments for `rcmd attach`.
#[derive(clap::Args)]
pub struct AttachArgs {
    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,

    /// Job id printed by `rcmd nohup`.
    pub id: u64,
}

/// Directory holding saved job handles.
fn jobs_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .context("no platform data directory")?
        .join("rcmd")
        .join("jobs"))
}

fn job_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id}.json"))
}

pub fn nohup(connect: &ConnectArgs, args: &CallArgs) -> Result<()> {
    let dir = jobs_dir()?;
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut master = connect.connect()?;
    let mut builder = master.nohup(&args.function).args(args.values());
    for (k, v) in args.keywords()? {
        builder = builder.karg(k, v);
    }
    let job = builder.send().map_err(report)?;
    let path = job_path(&dir, job.cmd_id());
    job.save(&path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    master.disconnect()?;
    println!("{}", job.cmd_id());
    Ok(())
}

pub fn list(format: OutputFormat) -> Result<()> {
    let dir = jobs_dir()?;
    let jobs = load_all(&dir)?;

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!("{:<8} {:<30} {}", "ID", "FUNCTION", "SCRATCH");
    for job in &jobs {
        println!(
            "{:<8} {:<30} {}",
            job.cmd_id(),
            job.peek_basecmd().name(),
            job.cmd_hash().unwrap_or("-")
        );
    }
    Ok(())
}

pub fn attach(connect: &ConnectArgs, args: &AttachArgs) -> Result<()> {
    let path = job_path(&jobs_dir()?, args.id);
    let job = CmdMaster::load(&path).with_context(|| format!("no saved job {}", args.id))?;

    let mut master = connect.connect()?;
    job.set_commander(&mut master)?;
    let mut done = job.wait(&mut master, connect.timeout()).map_err(report)?;
    master.close()?;

    fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
    if matches!(args.format, OutputFormat::Table) {
        write_output(&mut done)?;
    }
    print_value(done, args.format)
}

pub fn rm(ids: &[u64]) -> Result<()> {
    let dir = jobs_dir()?;
    for &id in ids {
        match fs::remove_file(job_path(&dir, id)) {
            Ok(()) => println!("{id}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => eprintln!("warning: no job {id}"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Loads every saved job, oldest id first. Unreadable files are skipped.
fn load_all(dir: &Path) -> Result<Vec<CmdMaster>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut jobs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|x| x != "json") {
            continue;
        }
        match CmdMaster::load(&path) {
            Ok(job) => jobs.push(job),
            Err(e) => tracing::warn!("skipping {}: {e}", path.display()),
        }
    }
    jobs.sort_by_key(CmdMaster::cmd_id);
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn load_all_sorts_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let a = CmdMaster::new(vec!["nohup".into(), "shell".into()], vec![], BTreeMap::new());
        let b = CmdMaster::new(vec!["nohup".into(), "sleep".into()], vec![], BTreeMap::new());
        b.save(&job_path(dir.path(), b.cmd_id())).unwrap();
        a.save(&job_path(dir.path(), a.cmd_id())).unwrap();
        fs::write(dir.path().join("junk.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let jobs = load_all(dir.path()).unwrap();
        let ids: Vec<_> = jobs.iter().map(CmdMaster::cmd_id).collect();
        assert_eq!(ids, [a.cmd_id(), b.cmd_id()]);
    }

    #[test]
    fn load_all_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_all(&dir.path().join("absent")).unwrap().is_empty());
    }
}

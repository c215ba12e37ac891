//! Run inspection: `quill status`.

use anyhow::Result;
use console::style;
use quill::audit::{AuditLogger, AuditRun};
use std::path::Path;

use super::super::Cli;
use super::{AUDIT_SUBDIR, load_config};

pub fn cmd_status(cli: &Cli, output: Option<&Path>) -> Result<()> {
    let output_dir = match output {
        Some(dir) => dir.to_path_buf(),
        None => load_config(cli)?.0.output.dir,
    };
    let mut audit = AuditLogger::new(&output_dir.join(AUDIT_SUBDIR));

    println!();
    if audit.load_current()?
        && let Some(run) = audit.current_run()
    {
        println!("{}", style("Run in progress").cyan().bold());
        print_run(run);
        return Ok(());
    }

    let runs = audit.list_runs()?;
    let Some(latest) = runs.first() else {
        println!("No runs found in {}", output_dir.display());
        println!();
        return Ok(());
    };

    let run = audit.load_run(latest)?;
    println!("{}", style("Last run").bold());
    print_run(&run);
    if runs.len() > 1 {
        println!("{} earlier run(s) recorded", runs.len() - 1);
        println!();
    }
    Ok(())
}

fn print_run(run: &AuditRun) {
    println!("  Run:       {}", run.run_id);
    if let Some(title) = &run.title {
        println!("  Title:     {}", title);
    }
    println!("  Status:    {}", run.status);
    println!("  Started:   {}", run.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(ended) = run.ended_at {
        println!("  Ended:     {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "  Chapters:  {}/{}",
        run.totals.chapters, run.chapters_planned
    );
    println!(
        "  Words:     {}/{}",
        run.totals.words, run.config.target_words
    );
    println!(
        "  Retries:   {}  Degraded: {}  Failed: {}",
        run.totals.retries, run.totals.degraded, run.totals.failed
    );
    println!("  Premise:   {}", style(&run.premise_preview).dim());
    println!();

    for (index, verdict) in run.degraded_verdicts() {
        println!(
            "  {} chapter {}: consistency {:.2}, coherence {:.2}",
            style("degraded").yellow(),
            index,
            verdict.consistency,
            verdict.coherence
        );
    }
}

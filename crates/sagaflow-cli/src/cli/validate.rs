//! `sagaflow validate`: structural checks over workflow files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::json;

use sagaflow_core::workflow::definition::{read_workflow_file, validate_definition, workflow_files};

/// Validation outcome for one file.
#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub errors: Vec<String>,
}

impl FileReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Expand directories into the workflow files they contain.
pub fn collect_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(
                workflow_files(path)
                    .with_context(|| format!("Failed to scan {}", path.display()))?,
            );
        } else if path.exists() {
            files.push(path.clone());
        } else {
            bail!("No such file or directory: {}", path.display());
        }
    }
    Ok(files)
}

/// Parse and validate a single file. Parse failures count as one error.
pub fn check_file(path: &Path) -> FileReport {
    let errors = match read_workflow_file(path) {
        Ok(def) => validate_definition(&def).errors,
        Err(e) => vec![e.to_string()],
    };
    FileReport {
        path: path.to_path_buf(),
        errors,
    }
}

pub fn handle_validate(paths: &[PathBuf], json: bool, quiet: bool) -> Result<()> {
    let files = collect_paths(paths)?;
    let reports: Vec<FileReport> = files.iter().map(|p| check_file(p)).collect();
    let invalid = reports.iter().filter(|r| !r.is_valid()).count();

    if json {
        let out: Vec<_> = reports
            .iter()
            .map(|r| {
                json!({
                    "path": r.path.display().to_string(),
                    "valid": r.is_valid(),
                    "errors": r.errors,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !quiet {
        println!();
        if reports.is_empty() {
            println!("  No workflow files found.");
        }
        for report in &reports {
            if report.is_valid() {
                println!("  {} {}", style("✓").green(), report.path.display());
            } else {
                println!("  {} {}", style("✗").red(), report.path.display());
                for error in &report.errors {
                    println!("      {}", style(error).dim());
                }
            }
        }
        println!();
    }

    if invalid > 0 {
        bail!("{invalid} of {} workflow file(s) failed validation", reports.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VALID: &str = r#"
id: wf
name: wf
version: "1"
steps:
  - type: task
    id: a
    task: { action: a.run }
"#;

    const DANGLING: &str = r#"
id: wf
name: wf
version: "1"
steps:
  - type: task
    id: a
    dependsOn: [ghost]
    compensation: undo
    task: { action: a.run }
"#;

    #[test]
    fn check_file_reports_every_problem() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.yaml");
        std::fs::write(&path, DANGLING).unwrap();

        let report = check_file(&path);
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 2, "got: {:?}", report.errors);
    }

    #[test]
    fn check_file_reports_unknown_step_type() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("odd.yaml");
        std::fs::write(
            &path,
            "id: wf\nname: wf\nversion: \"1\"\nsteps:\n  - type: loop\n    id: x\n",
        )
        .unwrap();

        let report = check_file(&path);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("loop"), "got: {:?}", report.errors);
    }

    #[test]
    fn collect_paths_expands_directories() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.yaml"), VALID).unwrap();
        std::fs::write(tmp.path().join("b.yml"), DANGLING).unwrap();
        std::fs::write(tmp.path().join("readme.md"), "skip").unwrap();

        let files = collect_paths(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(files.len(), 2);
        assert!(check_file(&files[0]).is_valid());
        assert!(!check_file(&files[1]).is_valid());
    }

    #[test]
    fn collect_paths_rejects_missing_path() {
        let tmp = TempDir::new().unwrap();
        assert!(collect_paths(&[tmp.path().join("missing.yaml")]).is_err());
    }

    #[test]
    fn handle_validate_fails_on_invalid_file() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.yaml");
        let bad = tmp.path().join("bad.yaml");
        std::fs::write(&good, VALID).unwrap();
        std::fs::write(&bad, DANGLING).unwrap();

        assert!(handle_validate(&[good.clone()], false, true).is_ok());
        let err = handle_validate(&[good, bad], false, true).unwrap_err();
        assert!(err.to_string().contains("1 of 2"), "got: {err}");
    }
}

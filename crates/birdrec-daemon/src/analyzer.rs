//! Bird call analyzer invocation
//!
//! The analyzer is an external program; this module only builds its command
//! line, runs it and maps the exit status.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::AnalyzerConfig;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("{0} path must not be empty")]
    EmptyPath(&'static str),
    #[error("Failed to launch analyzer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Analyzer exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

/// One analysis run; unset fields fall back to the configured values
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub sensitivity: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeReport {
    pub output: PathBuf,
    pub stdout: String,
}

#[derive(Debug, Clone)]
pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Arguments passed after the program name
    pub fn build_args(&self, req: &AnalyzeRequest) -> Result<Vec<String>, AnalyzerError> {
        if req.input.as_os_str().is_empty() {
            return Err(AnalyzerError::EmptyPath("Input"));
        }
        if req.output.as_os_str().is_empty() {
            return Err(AnalyzerError::EmptyPath("Output"));
        }

        let cfg = &self.config;
        let mut args = Vec::with_capacity(17);
        if !cfg.script.is_empty() {
            args.push(cfg.script.clone());
        }
        let pairs = [
            ("--i", req.input.display().to_string()),
            ("--o", req.output.display().to_string()),
            (
                "--rtype",
                req.output_format
                    .clone()
                    .unwrap_or_else(|| cfg.output_format.clone()),
            ),
            ("--lat", req.latitude.unwrap_or(cfg.latitude).to_string()),
            ("--lon", req.longitude.unwrap_or(cfg.longitude).to_string()),
            (
                "--min_conf",
                req.min_confidence.unwrap_or(cfg.min_confidence).to_string(),
            ),
            (
                "--sensitivity",
                req.sensitivity.unwrap_or(cfg.sensitivity).to_string(),
            ),
        ];
        for (flag, value) in pairs {
            args.push(flag.to_string());
            args.push(value);
        }
        Ok(args)
    }

    /// Run the analyzer to completion. Not retried on failure.
    pub async fn run(&self, req: &AnalyzeRequest) -> Result<AnalyzeReport, AnalyzerError> {
        let args = self.build_args(req)?;
        info!(
            program = %self.config.program,
            input = %req.input.display(),
            output = %req.output.display(),
            "Running analyzer"
        );

        let output = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| AnalyzerError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(code = ?output.status.code(), "Analyzer failed");
            return Err(AnalyzerError::Failed {
                code: output.status.code(),
                stderr,
            });
        }

        info!(output = %req.output.display(), "Analysis complete");
        Ok(AnalyzeReport {
            output: req.output.clone(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AnalyzeRequest {
        AnalyzeRequest {
            input: PathBuf::from("downloads"),
            output: PathBuf::from("results"),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_arguments() {
        let args = Analyzer::new(AnalyzerConfig::default())
            .build_args(&request())
            .unwrap();
        assert_eq!(
            args,
            [
                "Birdnet-Analyzer/analyze.py",
                "--i", "downloads",
                "--o", "results",
                "--rtype", "csv",
                "--lat", "-1",
                "--lon", "-1",
                "--min_conf", "0.5",
                "--sensitivity", "1",
            ]
        );
    }

    #[test]
    fn test_request_overrides_config() {
        let config = AnalyzerConfig {
            script: String::new(),
            ..Default::default()
        };
        let req = AnalyzeRequest {
            output_format: Some("table".into()),
            latitude: Some(10.5),
            min_confidence: Some(0.75),
            ..request()
        };

        let args = Analyzer::new(config).build_args(&req).unwrap();
        assert_eq!(args[0], "--i");
        assert_eq!(args[5], "table");
        assert_eq!(args[7], "10.5");
        assert_eq!(args[9], "-1");
        assert_eq!(args[11], "0.75");
    }

    #[test]
    fn test_empty_paths_rejected() {
        let analyzer = Analyzer::new(AnalyzerConfig::default());
        let req = AnalyzeRequest {
            input: PathBuf::new(),
            ..request()
        };
        assert!(matches!(
            analyzer.build_args(&req),
            Err(AnalyzerError::EmptyPath("Input"))
        ));

        let req = AnalyzeRequest {
            output: PathBuf::new(),
            ..request()
        };
        assert!(matches!(
            analyzer.build_args(&req),
            Err(AnalyzerError::EmptyPath("Output"))
        ));
    }

    fn shell(script: &str) -> Analyzer {
        Analyzer::new(AnalyzerConfig {
            program: "sh".into(),
            script: script.into(),
            ..Default::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("ok.sh");
        let fail = dir.path().join("fail.sh");
        std::fs::write(&ok, "echo analyzed \"$2\"\n").unwrap();
        std::fs::write(&fail, "echo 'model not found' >&2\nexit 3\n").unwrap();

        let report = shell(ok.to_str().unwrap()).run(&request()).await.unwrap();
        assert_eq!(report.stdout.trim(), "analyzed downloads");

        match shell(fail.to_str().unwrap()).run(&request()).await {
            Err(AnalyzerError::Failed { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "model not found");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let analyzer = Analyzer::new(AnalyzerConfig {
            program: "birdrec-no-such-analyzer".into(),
            ..Default::default()
        });
        assert!(matches!(
            analyzer.run(&request()).await,
            Err(AnalyzerError::Spawn { .. })
        ));
    }
}

// ABOUTME: Downstream transformation step that consumes the staged tables
// ABOUTME: Runs as a synchronous iterator of output lines ending in a success or failure event

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::config::TransformConfig;

/// One event from a running transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformEvent {
    Line(String),
    Finished(TransformStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformStatus {
    Success,
    Failure(String),
}

/// What the transformation should build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub stream_key: String,
    /// Model or target selected for this stream.
    pub model: String,
    /// Staging table holding this run's rows (the hashed table).
    pub temp_table: String,
}

pub type TransformEvents = Box<dyn Iterator<Item = TransformEvent> + Send>;

pub trait Transformer: Send + Sync {
    fn run(&self, request: &TransformRequest) -> Result<TransformEvents>;
}

/// Summary of a drained transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutcome {
    pub success: bool,
    pub lines: usize,
    pub detail: Option<String>,
}

/// Consume every event, logging output lines.
///
/// An iterator that ends without a `Finished` event is a failure.
pub fn drain(events: TransformEvents) -> TransformOutcome {
    let mut lines = 0;
    for event in events {
        match event {
            TransformEvent::Line(line) => {
                lines += 1;
                tracing::info!("[transform] {}", line);
            }
            TransformEvent::Finished(TransformStatus::Success) => {
                return TransformOutcome {
                    success: true,
                    lines,
                    detail: None,
                };
            }
            TransformEvent::Finished(TransformStatus::Failure(reason)) => {
                return TransformOutcome {
                    success: false,
                    lines,
                    detail: Some(reason),
                };
            }
        }
    }
    TransformOutcome {
        success: false,
        lines,
        detail: Some("transformation ended without a terminal status".to_string()),
    }
}

/// Used when no transformation is configured: the canonical load is the
/// downstream consumer, so staging success is downstream success.
pub struct NoTransform;

impl Transformer for NoTransform {
    fn run(&self, _request: &TransformRequest) -> Result<TransformEvents> {
        Ok(Box::new(std::iter::once(TransformEvent::Finished(
            TransformStatus::Success,
        ))))
    }
}

/// Runs an external program, e.g. `dbt build --select {model} --vars "temp_table_name: {temp_table}"`.
///
/// `{model}`, `{temp_table}` and `{stream}` in arguments are substituted per
/// request. Standard output becomes line events; standard error is inherited.
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
    project_dir: Option<PathBuf>,
}

impl CommandTransform {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            project_dir: config.project_dir.clone(),
        }
    }

    pub fn render_args(&self, request: &TransformRequest) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", &request.model)
                    .replace("{temp_table}", &request.temp_table)
                    .replace("{stream}", &request.stream_key)
            })
            .collect()
    }
}

impl Transformer for CommandTransform {
    fn run(&self, request: &TransformRequest) -> Result<TransformEvents> {
        let args = self.render_args(request);
        tracing::info!("Running transformation: {} {}", self.program, args.join(" "));

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.project_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start transformation '{}'", self.program))?;
        let lines = child.stdout.take().map(|out| BufReader::new(out).lines());

        Ok(Box::new(CommandEvents {
            child: Some(child),
            lines,
        }))
    }
}

struct CommandEvents {
    child: Option<Child>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
}

impl Iterator for CommandEvents {
    type Item = TransformEvent;

    fn next(&mut self) -> Option<TransformEvent> {
        if let Some(lines) = self.lines.as_mut() {
            match lines.next() {
                Some(Ok(line)) => return Some(TransformEvent::Line(line)),
                Some(Err(e)) => {
                    tracing::warn!("Failed to read transformation output: {}", e);
                    self.lines = None;
                }
                None => self.lines = None,
            }
        }

        let mut child = self.child.take()?;
        let status = match child.wait() {
            Ok(status) if status.success() => TransformStatus::Success,
            Ok(status) => TransformStatus::Failure(format!("transformation exited with {}", status)),
            Err(e) => TransformStatus::Failure(format!("failed to wait for transformation: {}", e)),
        };
        Some(TransformEvent::Finished(status))
    }
}

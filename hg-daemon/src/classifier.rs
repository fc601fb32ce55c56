//! External helmet classifier
//!
//! Capture and inference live in a separate program. Each invocation grabs
//! one frame and prints a JSON object `{"detections": [...], "image": ...}`
//! on stdout; anything else it prints is ignored.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use hg_core::{ClassifierConfig, FrameClassifier};
use hg_error::{HelmgateError, Result};
use hg_protocol::{ClassifierFrame, LABEL_HELMET, LABEL_NO_HELMET};

pub struct CommandClassifier {
    command: String,
    args: Vec<String>,
}

impl CommandClassifier {
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let command = config
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| HelmgateError::MissingConfig("classifier.command".into()))?;
        Ok(Self { command, args: config.args.clone() })
    }
}

/// Last line of `stdout` that decodes as a frame result
fn parse_frame(stdout: &[u8]) -> Option<ClassifierFrame> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str(l).ok())
}

impl FrameClassifier for CommandClassifier {
    fn classify_frame(&mut self) -> Result<ClassifierFrame> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| HelmgateError::classifier(format!("{}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HelmgateError::classifier(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        let frame = parse_frame(&output.stdout)
            .ok_or_else(|| HelmgateError::classifier("no frame result on stdout"))?;
        debug!(detections = frame.detections.len(), image = ?frame.image, "Classifier frame");
        Ok(frame)
    }
}

/// Refuse to start without the model and a label list naming both classes
pub fn check_resources(config: &ClassifierConfig) -> Result<()> {
    if let Some(model) = &config.model_path {
        if !model.is_file() {
            return Err(HelmgateError::ResourceMissing(format!("model file {}", model.display())));
        }
    }
    if let Some(labels) = &config.labels_path {
        check_labels(labels)?;
    }
    info!("Classifier resources present");
    Ok(())
}

fn check_labels(path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)
        .map_err(|_| HelmgateError::ResourceMissing(format!("label file {}", path.display())))?;
    let labels: Vec<&str> = text.lines().map(str::trim).collect();
    for wanted in [LABEL_HELMET, LABEL_NO_HELMET] {
        if !labels.contains(&wanted) {
            return Err(HelmgateError::ResourceMissing(format!(
                "label '{}' in {}",
                wanted,
                path.display()
            )));
        }
    }
    Ok(())
}

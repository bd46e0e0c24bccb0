use anyhow::Result;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::InputConfig;

/// One line of a JSONL prompt file.
#[derive(Debug, Clone, Deserialize)]
struct PromptRecord {
    prompt: String,
}

/// Endless, restartable supply of prompts.
///
/// Prompts are handed out round-robin from a shared index, so concurrent
/// callers never see the sequence run dry.
#[derive(Debug)]
pub struct Dataset {
    prompts: Vec<String>,
    next: AtomicUsize,
    label: String,
}

impl Dataset {
    /// A dataset that repeats one prompt forever.
    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            prompts: vec![prompt.to_string()],
            next: AtomicUsize::new(0),
            label: prompt.to_string(),
        }
    }

    /// Loads prompts from a JSONL file where each line is `{"prompt": "..."}`.
    pub async fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open dataset {}: {}", path.display(), e))?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut prompts = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<PromptRecord>(&line) {
                Ok(record) => prompts.push(record.prompt),
                Err(e) => warn!("Failed to parse prompt line: {}", e),
            }
        }

        if prompts.is_empty() {
            anyhow::bail!("No prompts found in {}", path.display());
        }

        debug!("Loaded {} prompts", prompts.len());

        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            prompts,
            next: AtomicUsize::new(0),
            label,
        })
    }

    pub async fn from_config(input: &InputConfig) -> Result<Self> {
        let mut dataset = match &input.file {
            Some(path) => Self::load(path).await?,
            None => Self::from_prompt(&input.prompt),
        };

        if input.shuffle {
            dataset.shuffle();
            info!("Shuffled {} prompts", dataset.len());
        }

        Ok(dataset)
    }

    pub fn shuffle(&mut self) {
        let mut rng = thread_rng();
        self.prompts.shuffle(&mut rng);
    }

    pub fn next_prompt(&self) -> String {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        self.prompts[idx % self.prompts.len()].clone()
    }

    /// Starts the sequence over from the first prompt.
    pub fn restart(&self) {
        self.next.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// File name of the dataset, or the prompt itself.
    pub fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_and_cycle() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"prompt": "first"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, r#"{{"prompt": "second", "max_tokens": 4}}"#).unwrap();
        file.flush().unwrap();

        let dataset = Dataset::load(file.path()).await.unwrap();
        assert_eq!(dataset.len(), 2);

        let drawn: Vec<String> = (0..5).map(|_| dataset.next_prompt()).collect();
        assert_eq!(drawn, ["first", "second", "first", "second", "first"]);

        dataset.restart();
        assert_eq!(dataset.next_prompt(), "first");
    }

    #[tokio::test]
    async fn test_empty_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(Dataset::load(file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_rejected() {
        assert!(Dataset::load(Path::new("/nonexistent/prompts.jsonl")).await.is_err());
    }

    #[tokio::test]
    async fn test_single_prompt() {
        let input = InputConfig::default();
        let dataset = Dataset::from_config(&input).await.unwrap();
        assert_eq!(dataset.label(), "how are you?");
        assert_eq!(dataset.next_prompt(), "how are you?");
        assert_eq!(dataset.next_prompt(), "how are you?");
    }
}

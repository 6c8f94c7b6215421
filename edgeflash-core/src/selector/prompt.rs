//! Operator prompts.

use anyhow::{Context, Result};
use dialoguer::Input;
use std::collections::VecDeque;

/// Line-oriented operator interaction. Blocking.
pub trait Prompter {
    /// Ask for one line of input. `default` is returned for an empty answer.
    fn ask(&mut self, prompt: &str, default: Option<&str>) -> Result<String>;

    /// Show an informational line.
    fn say(&mut self, line: &str);
}

/// Terminal prompter backed by dialoguer.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&mut self, prompt: &str, default: Option<&str>) -> Result<String> {
        let mut input = Input::<String>::new().with_prompt(prompt).allow_empty(true);
        if let Some(d) = default {
            input = input.default(d.to_string());
        }
        input
            .interact_text()
            .context("Failed to read operator input")
    }

    fn say(&mut self, line: &str) {
        println!("{line}");
    }
}

/// Replays canned answers; used by tests and unattended rehearsals.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    /// Every prompt and line shown, in order.
    pub transcript: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            transcript: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&mut self, prompt: &str, default: Option<&str>) -> Result<String> {
        self.transcript.push(format!("? {prompt}"));
        let answer = self
            .answers
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted answer left for prompt {prompt:?}"))?;
        if answer.is_empty() {
            return Ok(default.unwrap_or_default().to_string());
        }
        Ok(answer)
    }

    fn say(&mut self, line: &str) {
        self.transcript.push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_prompter_replays_and_uses_defaults() {
        let mut p = ScriptedPrompter::new(["1", ""]);
        assert_eq!(p.ask("pick", None).unwrap(), "1");
        assert_eq!(p.ask("slot", Some("nvme0n1")).unwrap(), "nvme0n1");
        assert!(p.ask("more", None).is_err());
        assert_eq!(p.transcript.len(), 3);
    }
}

//! User confirmation, injected into the lifecycle pipelines.
//!
//! The core never talks to a terminal itself. Every yes/no decision goes
//! through a [`Prompt`], so callers can plug in a terminal responder, a
//! non-interactive default, or a scripted sequence of answers in tests.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

/// Answer to a confirmation question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    Abort,
}

/// A policy that may answer on its own or ask the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuadOption {
    Yes,
    No,
    AskYes,
    AskNo,
}

impl QuadOption {
    /// Resolve the policy, asking only for the `Ask*` variants.
    pub fn query(self, prompt: &mut dyn Prompt, question: &str) -> Answer {
        match self {
            Self::Yes => Answer::Yes,
            Self::No => Answer::No,
            Self::AskYes => prompt.confirm(question, Answer::Yes),
            Self::AskNo => prompt.confirm(question, Answer::No),
        }
    }
}

/// Synchronous confirmation capability.
pub trait Prompt {
    /// Ask `question`; `default` is what an empty reply means.
    fn confirm(&mut self, question: &str, default: Answer) -> Answer;
}

impl<P: Prompt + ?Sized> Prompt for &mut P {
    fn confirm(&mut self, question: &str, default: Answer) -> Answer {
        (**self).confirm(question, default)
    }
}

impl<P: Prompt + ?Sized> Prompt for Box<P> {
    fn confirm(&mut self, question: &str, default: Answer) -> Answer {
        (**self).confirm(question, default)
    }
}

/// Answers every question with its default. Used when no user is present.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl Prompt for NonInteractive {
    fn confirm(&mut self, question: &str, default: Answer) -> Answer {
        tracing::debug!(question, ?default, "Answering prompt with default");
        default
    }
}

/// Answers every question with the same reply.
#[derive(Debug, Clone, Copy)]
pub struct AlwaysAnswer(pub Answer);

impl Prompt for AlwaysAnswer {
    fn confirm(&mut self, _question: &str, _default: Answer) -> Answer {
        self.0
    }
}

/// Replays a fixed list of answers and records the questions asked.
///
/// Once the script runs out, questions get their default.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<Answer>,
    asked: Vec<String>,
}

impl ScriptedPrompt {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            asked: Vec::new(),
        }
    }

    /// Questions in the order they were asked.
    pub fn asked(&self) -> &[String] {
        &self.asked
    }

    /// Answers not consumed yet.
    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

impl Prompt for ScriptedPrompt {
    fn confirm(&mut self, question: &str, default: Answer) -> Answer {
        self.asked.push(question.to_string());
        self.answers.pop_front().unwrap_or(default)
    }
}

/// Line-based terminal responder: `y`, `n`, or `q`/ctrl-D to abort.
pub struct TerminalPrompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> TerminalPrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Prompt for TerminalPrompt<R, W> {
    fn confirm(&mut self, question: &str, default: Answer) -> Answer {
        let hint = match default {
            Answer::Yes => "([yes]/no)",
            _ => "(yes/[no])",
        };
        loop {
            if write!(self.output, "{question} {hint}: ").is_err() || self.output.flush().is_err() {
                return default;
            }
            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return Answer::Abort,
                Ok(_) => {}
            }
            match parse_reply(&line) {
                Some(answer) => return answer,
                None if line.trim().is_empty() => return default,
                None => continue,
            }
        }
    }
}

fn parse_reply(line: &str) -> Option<Answer> {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" | "s" | "si" | "sí" => Some(Answer::Yes),
        "n" | "no" => Some(Answer::No),
        "q" | "quit" | "abort" => Some(Answer::Abort),
        _ => None,
    }
}

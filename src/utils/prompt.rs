/// Operator interaction capabilities
///
/// Orchestrators never read stdin themselves; they take a `&dyn Prompt`.
/// Non-interactive contexts (tests, cron) use `AssumeNo`, which answers
/// every confirmation with "no" and every selection with nothing.

use std::io::{self, Write};

pub trait Prompt {
    /// Ask a yes/no question. `default_yes` is the answer on empty input.
    fn confirm(&self, question: &str, default_yes: bool) -> bool;

    /// Pick one entry from a list. Returns the chosen index.
    fn select(&self, title: &str, items: &[String]) -> Option<usize>;
}

/// Interactive stdin prompt.
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn confirm(&self, question: &str, default_yes: bool) -> bool {
        let hint = if default_yes { "[Y/n]" } else { "[y/N]" };
        print!("{} {}: ", question, hint);
        let _ = io::stdout().flush();

        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return false;
        }

        match answer.trim().to_lowercase().as_str() {
            "" => default_yes,
            "y" | "yes" => true,
            _ => false,
        }
    }

    fn select(&self, title: &str, items: &[String]) -> Option<usize> {
        if items.is_empty() {
            return None;
        }

        println!("{}", title);
        for (i, item) in items.iter().enumerate() {
            println!("  {:>2}) {}", i + 1, item);
        }
        print!("Selection (1-{}, empty to cancel): ", items.len());
        let _ = io::stdout().flush();

        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return None;
        }

        let choice: usize = answer.trim().parse().ok()?;
        if choice >= 1 && choice <= items.len() {
            Some(choice - 1)
        } else {
            None
        }
    }
}

/// Fail-closed prompt for non-interactive contexts.
pub struct AssumeNo;

impl Prompt for AssumeNo {
    fn confirm(&self, _question: &str, _default_yes: bool) -> bool {
        false
    }

    fn select(&self, _title: &str, _items: &[String]) -> Option<usize> {
        None
    }
}

/// Scripted prompt answers for tests.
#[cfg(test)]
pub struct ScriptedPrompt {
    pub confirm_answer: bool,
    pub selection: Option<usize>,
}

#[cfg(test)]
impl Prompt for ScriptedPrompt {
    fn confirm(&self, _question: &str, _default_yes: bool) -> bool {
        self.confirm_answer
    }

    fn select(&self, _title: &str, items: &[String]) -> Option<usize> {
        self.selection.filter(|&i| i < items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assume_no_fails_closed() {
        let prompt = AssumeNo;
        assert!(!prompt.confirm("delete everything?", true));
        assert_eq!(prompt.select("pick", &["a".to_string()]), None);
    }
}

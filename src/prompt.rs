use std::io::IsTerminal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("read input: {0}")]
    Dialog(#[from] dialoguer::Error),

    #[error("read input: {0}")]
    IOError(#[from] std::io::Error),

    #[error("input ended before a value was read")]
    EndOfInput,
}

/// Line-oriented conversation with the operator.
pub trait Prompt {
    /// Read one trimmed line. An empty answer yields `default` when one is given.
    fn line(&mut self, text: &str, default: Option<&str>) -> Result<String, Error>;

    /// Read a secret without echoing it.
    fn password(&mut self, text: &str) -> Result<String, Error>;

    /// Show a line of text to the operator.
    fn say(&mut self, text: &str);
}

/// Prompts on the controlling terminal.
pub struct Terminal;

impl Prompt for Terminal {
    fn line(&mut self, text: &str, default: Option<&str>) -> Result<String, Error> {
        let mut input = dialoguer::Input::<String>::new()
            .with_prompt(text)
            .allow_empty(true);
        if let Some(default) = default {
            input = input.default(default.to_string());
        }
        Ok(input.interact_text()?.trim().to_string())
    }

    fn password(&mut self, text: &str) -> Result<String, Error> {
        if std::io::stdin().is_terminal() {
            return Ok(dialoguer::Password::new().with_prompt(text).interact()?);
        }
        // Piped input, e.g. `cat pw.txt | apiop change registry --password-stdin`.
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            return Err(Error::EndOfInput);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn say(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Ask until `valid` accepts the answer.
pub fn read_validated(
    prompt: &mut dyn Prompt,
    text: &str,
    default: Option<&str>,
    valid: impl Fn(&str) -> bool,
    invalid_text: &str,
) -> Result<String, Error> {
    loop {
        let value = prompt.line(text, default)?;
        if valid(&value) {
            return Ok(value);
        }
        prompt.say(invalid_text);
    }
}

/// Ask for one of `options`.
pub fn read_option(prompt: &mut dyn Prompt, text: &str, options: &[i32]) -> Result<i32, Error> {
    let listed = options.iter().map(i32::to_string).collect::<Vec<_>>().join(", ");
    loop {
        let value = prompt.line(text, None)?;
        match value.parse::<i32>() {
            Ok(option) if options.contains(&option) => return Ok(option),
            _ => prompt.say(&format!("Choose one of {listed}")),
        }
    }
}

fn agree(prompt: &mut dyn Prompt, text: &str, default: &str) -> Result<bool, Error> {
    let answer = prompt.line(text, Some(default))?;
    Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
}

/// Ask for confirmation, defaulting to yes.
pub fn confirm(prompt: &mut dyn Prompt, text: &str) -> Result<bool, Error> {
    agree(prompt, text, "Y")
}

/// Ask before destroying something, defaulting to no.
pub fn confirm_destructive(prompt: &mut dyn Prompt, text: &str) -> Result<bool, Error> {
    agree(prompt, text, "N")
}

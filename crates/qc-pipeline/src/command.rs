//! Command lines handed to the process runner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

/// Errors produced while splitting a command-line string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandLineError {
    #[error("command line is empty")]
    Empty,

    #[error("unterminated {quote} quote in command line")]
    UnterminatedQuote { quote: char },
}

/// A program plus its argument vector, already split into words.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandLine {
    /// Executable name or path.
    pub program: String,

    /// Arguments passed verbatim to the executable.
    pub args: Vec<String>,
}

impl CommandLine {
    /// Create a command line from a program and its arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a full command-line string into program and arguments.
    ///
    /// Words are separated by whitespace. Single and double quotes group
    /// words; inside double quotes `\"` and `\\` are escapes. Outside quotes a
    /// backslash only escapes a following quote, backslash or whitespace, so
    /// `C:\tools\python.exe` survives untouched.
    ///
    /// A `\"` that ends a word and is the last double quote on the line is a
    /// literal backslash followed by the closing quote, so a quoted directory
    /// such as `"C:\reports\"` parses as `C:\reports\`.
    pub fn parse(line: &str) -> Result<Self, CommandLineError> {
        let mut words = Vec::new();
        let mut current = String::new();
        let mut in_word = false;
        let mut chars = line.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                '"' => {
                    in_word = true;
                    loop {
                        match chars.next() {
                            Some('"') => break,
                            Some('\\') => match chars.peek().copied() {
                                Some('"') if closes_quoted_word(chars.clone()) => {
                                    current.push('\\');
                                    chars.next();
                                    break;
                                }
                                Some(esc @ ('"' | '\\')) => {
                                    current.push(esc);
                                    chars.next();
                                }
                                _ => current.push('\\'),
                            },
                            Some(c) => current.push(c),
                            None => return Err(CommandLineError::UnterminatedQuote { quote: '"' }),
                        }
                    }
                }
                '\'' => {
                    in_word = true;
                    loop {
                        match chars.next() {
                            Some('\'') => break,
                            Some(c) => current.push(c),
                            None => {
                                return Err(CommandLineError::UnterminatedQuote { quote: '\'' })
                            }
                        }
                    }
                }
                '\\' => {
                    in_word = true;
                    match chars.peek() {
                        Some(&esc) if matches!(esc, '"' | '\'' | '\\') || esc.is_whitespace() => {
                            current.push(esc);
                            chars.next();
                        }
                        _ => current.push('\\'),
                    }
                }
                c => {
                    in_word = true;
                    current.push(c);
                }
            }
        }

        if in_word {
            words.push(current);
        }

        let mut words = words.into_iter();
        let program = words.next().ok_or(CommandLineError::Empty)?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }
}

/// Whether the `"` at the front of `rest` ends the word with no other
/// double quote left to close it.
fn closes_quoted_word(mut rest: Peekable<Chars<'_>>) -> bool {
    rest.next();
    match rest.peek() {
        Some(c) if !c.is_whitespace() => false,
        _ => !rest.any(|c| c == '"'),
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_word(f, &self.program)?;
        for arg in &self.args {
            f.write_str(" ")?;
            write_word(f, arg)?;
        }
        Ok(())
    }
}

/// Write one word, double-quoting it when [`CommandLine::parse`] would
/// otherwise split or unescape it.
fn write_word(f: &mut fmt::Formatter<'_>, word: &str) -> fmt::Result {
    let needs_quotes = word.is_empty()
        || word
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'));
    if !needs_quotes {
        return f.write_str(word);
    }

    f.write_str("\"")?;
    for c in word.chars() {
        if matches!(c, '"' | '\\') {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_words() {
        let cmd = CommandLine::parse("python3 detect_black.py --input clip.mp4").unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["detect_black.py", "--input", "clip.mp4"]);
    }

    #[test]
    fn test_parse_double_quoted_path_with_spaces() {
        let cmd =
            CommandLine::parse(r#"python3 ocr.py --input "/media/My Clips/clip.mp4" --output "out.json""#)
                .unwrap();
        assert_eq!(cmd.args[2], "/media/My Clips/clip.mp4");
        assert_eq!(cmd.args[4], "out.json");
    }

    #[test]
    fn test_parse_keeps_windows_backslashes() {
        let cmd = CommandLine::parse(r#"C:\Python312\python.exe "C:\clips\a b.mp4""#).unwrap();
        assert_eq!(cmd.program, r"C:\Python312\python.exe");
        assert_eq!(cmd.args, vec![r"C:\clips\a b.mp4"]);
    }

    #[test]
    fn test_parse_quoted_directory_with_trailing_backslash() {
        let cmd = CommandLine::parse(r#"echo --output "C:\reports\""#).unwrap();
        assert_eq!(cmd.args, vec!["--output", r"C:\reports\"]);

        let cmd = CommandLine::parse(r#"tool "C:\out dir\" --force"#).unwrap();
        assert_eq!(cmd.args, vec![r"C:\out dir\", "--force"]);
    }

    #[test]
    fn test_parse_escaped_quote_before_space_stays_escaped() {
        let cmd = CommandLine::parse(r#"echo "say \"hi\" now""#).unwrap();
        assert_eq!(cmd.args, vec![r#"say "hi" now"#]);
    }

    #[test]
    fn test_parse_single_quotes_are_literal() {
        let cmd = CommandLine::parse(r#"sh -c 'echo "hi" \n'"#).unwrap();
        assert_eq!(cmd.args, vec!["-c", r#"echo "hi" \n"#]);
    }

    #[test]
    fn test_parse_empty_quoted_argument() {
        let cmd = CommandLine::parse(r#"tool "" x"#).unwrap();
        assert_eq!(cmd.args, vec!["", "x"]);
    }

    #[test]
    fn test_parse_empty_line() {
        assert_eq!(CommandLine::parse("   "), Err(CommandLineError::Empty));
    }

    #[test]
    fn test_parse_unterminated_quote() {
        assert_eq!(
            CommandLine::parse(r#"tool "unterminated"#),
            Err(CommandLineError::UnterminatedQuote { quote: '"' })
        );
    }

    #[test]
    fn test_display_quotes_only_when_needed() {
        let cmd = CommandLine::new("python3", ["a.py", "--input", "/tmp/my clip.mp4", ""]);
        assert_eq!(cmd.to_string(), r#"python3 a.py --input "/tmp/my clip.mp4" """#);
    }

    #[test]
    fn test_display_parses_back_to_same_command() {
        let cmd = CommandLine::new(
            r"C:\Python312\python.exe",
            [r#"say "hi""#, r"trailing\", "it's"],
        );
        assert_eq!(CommandLine::parse(&cmd.to_string()).unwrap(), cmd);
    }
}

//! The operator's terminal.

use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use vmcore::{Console, ConsoleInput};

/// Line-oriented console on stdin/stdout.
///
/// Ctrl-C while waiting for input is reported as
/// [`ConsoleInput::Interrupted`] instead of ending the process.
pub struct TerminalConsole {
    lines: Lines<BufReader<Stdin>>,
}

impl TerminalConsole {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for TerminalConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for TerminalConsole {
    async fn read_line(&mut self, prompt: &str) -> io::Result<ConsoleInput> {
        let mut stdout = io::stdout();
        write!(stdout, "{prompt}")?;
        stdout.flush()?;

        // `next_line` is cancel safe, so losing the race to Ctrl-C drops no input.
        tokio::select! {
            line = self.lines.next_line() => Ok(match line? {
                Some(line) => ConsoleInput::Line(line),
                None => {
                    println!();
                    ConsoleInput::Eof
                }
            }),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                println!();
                Ok(ConsoleInput::Interrupted)
            }
        }
    }

    fn render(&mut self, text: &str) {
        println!("{text}");
    }

    fn notice(&mut self, text: &str) {
        println!("{text}");
    }
}

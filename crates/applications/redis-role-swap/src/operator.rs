//! Operator confirmation

use crate::error::{Result, RoleSwapError};
use std::io::{BufRead, BufReader, Stdin, Stdout, Write};
use std::sync::Mutex;

/// Human confirmation gate
pub trait Operator: Send + Sync {
    /// Ask a yes/no question
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Asks on a terminal, re-asking until the answer is Y or N
pub struct ConsoleOperator<R, W> {
    io: Mutex<(R, W)>,
}

impl ConsoleOperator<BufReader<Stdin>, Stdout> {
    /// Operator on stdin/stdout
    pub fn stdio() -> Self {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<R, W> ConsoleOperator<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    /// Operator on arbitrary streams
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }
}

impl<R, W> Operator for ConsoleOperator<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn confirm(&self, question: &str) -> Result<bool> {
        let mut guard = self
            .io
            .lock()
            .map_err(|_| RoleSwapError::config("operator console poisoned"))?;
        let (input, output) = &mut *guard;

        loop {
            write!(output, "{}? (Y/N) ", question)?;
            output.flush()?;

            let mut answer = String::new();
            if input.read_line(&mut answer)? == 0 {
                // EOF counts as no
                writeln!(output)?;
                return Ok(false);
            }

            match answer.trim() {
                "Y" | "y" => return Ok(true),
                "N" | "n" => return Ok(false),
                _ => writeln!(output, "This is a Y or N question. OK?")?,
            }
        }
    }
}

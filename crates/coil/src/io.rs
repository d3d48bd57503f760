//! Destinations for the `print` statement.
//!
//! The VM keeps the softspace flag itself, so a writer only sees item text, the single
//! spaces between items and line ends, in order.

use std::io::{self, Write as _};

/// Receives what `print` statements without a `>>` target produce.
///
/// A failing writer surfaces in the running code as `IOError`.
pub trait PrintWriter {
    /// Writes the text of one printed item, or the space separating two items.
    fn write_text(&mut self, text: &str) -> io::Result<()>;

    /// Ends the current line.
    fn newline(&mut self) -> io::Result<()> {
        self.write_text("\n")
    }
}

/// Writes to the process's stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_text(&mut self, text: &str) -> io::Result<()> {
        io::stdout().lock().write_all(text.as_bytes())
    }

    fn newline(&mut self) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// Collects everything printed into a string, for tests and for hosts that post-process output.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.0.push_str(text);
        Ok(())
    }
}

/// Discards output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_text(&mut self, _text: &str) -> io::Result<()> {
        Ok(())
    }

    fn newline(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collected_lines() {
        let mut print = CollectStringPrint::new();
        print.write_text("a").unwrap();
        print.write_text(" ").unwrap();
        print.write_text("b").unwrap();
        print.newline().unwrap();
        assert_eq!(print.output(), "a b\n");
    }
}

use std::fmt::{self, Display, Write as _};

use serde::{Deserialize, Serialize};

use crate::exception_private::{ExcType, SimpleException};

/// One entry of a traceback: where a frame was when the exception passed through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub filename: String,
    /// Name of the code object (`<module>`, the function name, the class name).
    pub name: String,
    /// Source line from the code's line table, `None` when the code has no line table.
    pub line: Option<u32>,
    /// Byte offset of the instruction that was executing.
    pub ip: usize,
}

impl Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "  File \"{}\", line {line}, in {}", self.filename, self.name),
            None => write!(f, "  in {} +{}", self.name, self.ip),
        }
    }
}

/// An exception that escaped the outermost frame, detached from the heap.
///
/// `Display` gives the last line of a traceback (`Type: message`);
/// [`traceback_text`](Self::traceback_text) gives the full report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    type_name: String,
    /// The builtin exception type this one is, or derives from.
    builtin: Option<ExcType>,
    message: Option<String>,
    /// Outermost frame first.
    traceback: Vec<StackFrame>,
    /// Process exit status requested by `SystemExit`.
    exit_code: Option<i32>,
}

impl Exception {
    /// Creates an exception of a builtin type, without a traceback.
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self {
            type_name: exc_type.to_string(),
            builtin: Some(exc_type),
            message,
            traceback: Vec::new(),
            exit_code: (exc_type == ExcType::SystemExit).then_some(0),
        }
    }

    pub(crate) fn from_parts(
        type_name: String,
        builtin: Option<ExcType>,
        message: Option<String>,
        traceback: Vec<StackFrame>,
        exit_code: Option<i32>,
    ) -> Self {
        Self {
            type_name,
            builtin,
            message,
            traceback,
            exit_code,
        }
    }

    /// Name of the exception's class, which may be a user-defined subclass.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The builtin exception type this exception is, or derives from.
    #[must_use]
    pub fn exc_type(&self) -> Option<ExcType> {
        self.builtin
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Frames the exception passed through, outermost first.
    #[must_use]
    pub fn traceback(&self) -> &[StackFrame] {
        &self.traceback
    }

    /// Whether the exception is (a subclass of) `SystemExit`.
    #[must_use]
    pub fn is_system_exit(&self) -> bool {
        self.builtin.is_some_and(|t| t.is_subclass_of(ExcType::SystemExit))
    }

    #[must_use]
    pub fn is_memory_error(&self) -> bool {
        self.builtin.is_some_and(|t| t.is_subclass_of(ExcType::MemoryError))
    }

    /// The status a process should exit with: the `SystemExit` code, 1 for any other
    /// uncaught exception.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_system_exit() {
            self.exit_code.unwrap_or(0)
        } else {
            1
        }
    }

    /// `Type: message`, or just `Type`.
    #[must_use]
    pub fn summary(&self) -> String {
        self.to_string()
    }

    /// The full report: header, one line per frame, then the summary.
    #[must_use]
    pub fn traceback_text(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in &self.traceback {
            let _ = writeln!(out, "{frame}");
        }
        let _ = write!(out, "{self}");
        out
    }
}

impl Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) if !message.is_empty() => write!(f, "{}: {message}", self.type_name),
            _ => f.write_str(&self.type_name),
        }
    }
}

impl std::error::Error for Exception {}

impl From<SimpleException> for Exception {
    fn from(exc: SimpleException) -> Self {
        Self::new(exc.exc_type(), exc.arg().map(str::to_owned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceback_text_lists_frames_outermost_first() {
        let exc = Exception::from_parts(
            "ValueError".to_owned(),
            Some(ExcType::ValueError),
            Some("bad".to_owned()),
            vec![
                StackFrame {
                    filename: "main.py".to_owned(),
                    name: "<module>".to_owned(),
                    line: Some(3),
                    ip: 12,
                },
                StackFrame {
                    filename: "main.py".to_owned(),
                    name: "f".to_owned(),
                    line: None,
                    ip: 4,
                },
            ],
            None,
        );
        assert_eq!(
            exc.traceback_text(),
            "Traceback (most recent call last):\n  File \"main.py\", line 3, in <module>\n  in f +4\nValueError: bad"
        );
        assert_eq!(exc.exit_code(), 1);
    }

    #[test]
    fn system_exit_codes() {
        let exc = Exception::new(ExcType::SystemExit, None);
        assert!(exc.is_system_exit());
        assert_eq!(exc.exit_code(), 0);
        assert_eq!(exc.to_string(), "SystemExit");
    }
}

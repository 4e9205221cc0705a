use std::fmt;

/// One active call frame at the moment a runtime error was raised.
pub struct BacktraceFrame {
    pub line: u32,
    pub name: Option<String>,
}

impl fmt::Display for BacktraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// The frames active when a runtime error was thrown, top (innermost) call
/// first, matching the order `print_error`/stderr reporting walks them in.
#[derive(Default)]
pub struct Backtrace {
    pub frames: Vec<BacktraceFrame>,
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

/// A runtime (post-compile) failure: a message plus the call stack active
/// when it was raised.
pub struct RuntimeError {
    pub message: String,
    pub backtrace: Backtrace,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: Backtrace::default(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        write!(f, "{}", self.backtrace)
    }
}

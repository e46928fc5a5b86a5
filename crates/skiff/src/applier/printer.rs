use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Mutex;

use owo_colors::OwoColorize;

use crate::ddl::DdlStatement;

struct PrinterState {
    out: Box<dyn Write + Send>,
    color: bool,
    last_instance: Option<String>,
    last_schema: Option<String>,
    seen_instances: HashSet<String>,
}

/// Serialises DDL output from concurrent workers.
///
/// In full mode every statement is printed, preceded by `-- instance: ...`
/// and `\c database` lines whenever the target changes. In brief mode only
/// the name of each instance with differences is printed, once.
pub struct Printer {
    brief: bool,
    state: Mutex<PrinterState>,
}

impl Printer {
    /// Print to stdout, with colors when stdout is a terminal.
    pub fn stdout(brief: bool) -> Self {
        use std::io::IsTerminal;
        let color = io::stdout().is_terminal();
        Self::new(brief, Box::new(io::stdout()), color)
    }

    pub fn new(brief: bool, out: Box<dyn Write + Send>, color: bool) -> Self {
        Self {
            brief,
            state: Mutex::new(PrinterState {
                out,
                color,
                last_instance: None,
                last_schema: None,
                seen_instances: HashSet::new(),
            }),
        }
    }

    pub fn is_brief(&self) -> bool {
        self.brief
    }

    pub fn print_ddl(&self, instance: &str, schema: &str, ddl: &DdlStatement) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let state = &mut *state;

        if self.brief {
            if state.seen_instances.insert(instance.to_string()) {
                writeln!(state.out, "{}", instance)?;
            }
            return Ok(());
        }

        if state.last_instance.as_deref() != Some(instance) {
            let header = format!("-- instance: {}", instance);
            if state.color {
                writeln!(state.out, "{}", header.dimmed())?;
            } else {
                writeln!(state.out, "{}", header)?;
            }
            state.last_instance = Some(instance.to_string());
            state.last_schema = None;
        }
        if state.last_schema.as_deref() != Some(schema) {
            writeln!(state.out, "\\c {}", schema)?;
            state.last_schema = Some(schema.to_string());
        }
        if state.color {
            writeln!(state.out, "{}", ddl.to_string().cyan())?;
        } else {
            writeln!(state.out, "{}", ddl)?;
        }
        state.out.flush()
    }
}

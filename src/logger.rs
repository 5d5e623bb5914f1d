//! Line-oriented build output with a coloured per-task prefix.
//!
//! Tasks run in parallel and interleave their output; every record is one
//! whole line written under a lock, so lines never tear.

use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::Mutex;

use console::Style;

pub struct Logger {
    color_enabled: bool,
    /// Pad task ids to this width so prefixes line up; 0 disables padding.
    prefix_width: usize,
    mu: Mutex<()>,
}

/// High-contrast styles that work on light and dark terminals.
fn palette() -> [Style; 9] {
    [
        Style::new().cyan(),
        Style::new().green(),
        Style::new().yellow(),
        Style::new().blue(),
        Style::new().magenta(),
        Style::new().red().bright(),
        Style::new().green().bright(),
        Style::new().blue().bright(),
        Style::new().cyan().bright(),
    ]
}

fn style_for(task_id: &str) -> Style {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    task_id.hash(&mut hasher);
    let styles = palette();
    styles[(hasher.finish() % styles.len() as u64) as usize].clone()
}

impl Logger {
    pub fn new(color_enabled: bool, prefix_width: usize) -> Logger {
        Logger {
            color_enabled,
            prefix_width,
            mu: Mutex::new(()),
        }
    }

    /// A plain line to stdout.
    pub fn line(&self, msg: &str) {
        let _guard = self.mu.lock().unwrap();
        println!("{}", msg);
    }

    /// A plain line to stderr.
    pub fn error(&self, msg: &str) {
        let _guard = self.mu.lock().unwrap();
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", msg);
    }

    /// One line of a task's output, prefixed with the task id.
    pub fn task_line(&self, task_id: &str, line: &str) {
        let prefix = self.task_prefix(task_id);
        let _guard = self.mu.lock().unwrap();
        if line.is_empty() {
            println!("{}", prefix);
        } else {
            println!("{} {}", prefix, line);
        }
    }

    fn task_prefix(&self, task_id: &str) -> String {
        let name = if self.prefix_width > 0 {
            format!("{:<width$}", task_id, width = self.prefix_width)
        } else {
            task_id.to_string()
        };

        if !self.color_enabled {
            return format!("{} |", name);
        }
        format!("{}", style_for(task_id).apply_to(format!("{} |", name)))
    }
}

use std::fmt::Write;

use anyhow::anyhow;
use unicode_width::UnicodeWidthStr;

use crate::render::{ChartRenderer, RenderFrame};

const MIN_BAR_COLS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct TextChart {
    color: bool,
    output: String,
}

impl TextChart {
    pub fn new(color: bool) -> Self {
        Self {
            color,
            output: String::new(),
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

struct Row {
    id: String,
    owner: String,
    avatar: String,
    name: String,
    start: f64,
    end: f64,
}

impl ChartRenderer for TextChart {
    fn draw(&mut self, frame: &RenderFrame<'_>) -> anyhow::Result<()> {
        let mut rows = Vec::with_capacity(frame.tasks.len());

        for (idx, task) in frame.tasks.iter().enumerate() {
            if !task.is_record() {
                return Err(anyhow!("task #{} is not an object", idx + 1));
            }
            let label = task.id().unwrap_or_else(|| format!("#{}", idx + 1));
            let start = task
                .start()
                .ok_or_else(|| anyhow!("task {label} has no numeric start"))?;
            let end = task.end().unwrap_or(start);
            if !start.is_finite() || !end.is_finite() || end < start {
                return Err(anyhow!("task {label} ends before it starts"));
            }

            let (owner, avatar) = match task.owner() {
                Some(key) => match frame.owners.get(key) {
                    Some(info) => {
                        let avatar = match frame.avatar(key) {
                            Some(entry) => {
                                format!("{}x{}", entry.natural_width, entry.natural_height)
                            }
                            None if info.avatar().is_some() => "…".to_string(),
                            None => String::new(),
                        };
                        (info.name().unwrap_or(key).to_string(), avatar)
                    }
                    None => (self.paint(&format!("{key}?"), "31"), String::new()),
                },
                None => (String::new(), String::new()),
            };

            rows.push(Row {
                id: self.paint(&label, "33"),
                owner,
                avatar,
                name: task.name().unwrap_or_default().to_string(),
                start,
                end,
            });
        }

        let origin = rows.iter().map(|row| row.start).fold(f64::INFINITY, f64::min);
        let horizon = rows.iter().map(|row| row.end).fold(f64::NEG_INFINITY, f64::max);
        let span = (horizon - origin).max(f64::EPSILON);
        let bar_cols = (usize::from(frame.width) / 2).max(MIN_BAR_COLS);

        let headers = vec![
            "ID".to_string(),
            "Owner".to_string(),
            "Avatar".to_string(),
            "Task".to_string(),
            "Timeline".to_string(),
        ];
        let table = rows
            .into_iter()
            .map(|row| {
                let from = (((row.start - origin) / span) * bar_cols as f64).round() as usize;
                let to = (((row.end - origin) / span) * bar_cols as f64).round() as usize;
                let width = to.saturating_sub(from).max(1);
                let bar = format!("{}{}", " ".repeat(from.min(bar_cols)), "█".repeat(width));
                vec![row.id, row.owner, row.avatar, row.name, bar]
            })
            .collect();

        let mut out = String::new();
        write_table(&mut out, headers, table)?;
        self.output = out;
        Ok(())
    }
}

fn write_table(
    out: &mut String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }
    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    let mut line = String::new();
    for (header, &width) in headers.iter().zip(&widths) {
        write!(line, "{header:width$} ")?;
    }
    writeln!(out, "{}", line.trim_end())?;

    line.clear();
    for &width in &widths {
        write!(line, "{:-<width$} ", "")?;
    }
    writeln!(out, "{}", line.trim_end())?;

    for row in rows {
        line.clear();
        for (cell, &width) in row.iter().zip(&widths) {
            let visible = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            write!(line, "{}{} ", cell, " ".repeat(width.saturating_sub(visible)))?;
        }
        writeln!(out, "{}", line.trim_end())?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }
        if ch == '\x1b' {
            escaped = true;
            continue;
        }
        out.push(ch);
    }

    out
}

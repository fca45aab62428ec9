use chrono::{Datelike, Duration, NaiveDate};

use crate::i18n;
use crate::services::calendar::NormalizedEvent;

pub const TODAY_COLOR: &str = "#f6b26b";
pub const LABEL_COLOR: &str = "#d9d9d9";
pub const EMPTY_COLOR: &str = "#ffffff";

/// Text tables wider than this per column get their cells shortened.
const MAX_COLUMN_WIDTH: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub text: String,
    pub color: String,
}

impl Cell {
    fn empty() -> Self {
        Self {
            text: String::new(),
            color: EMPTY_COLOR.to_string(),
        }
    }
}

/// Week-by-week table of events, Monday first.
///
/// `cells` holds one block per week: a date-label row followed by
/// `rows_per_week` event rows, each row seven cells wide.
#[derive(Debug, Clone, PartialEq)]
pub struct GridModel {
    pub column_headers: Vec<String>,
    pub first_date: NaiveDate,
    pub total_days: u32,
    pub rows_per_week: usize,
    pub cells: Vec<Vec<Cell>>,
}

pub struct GridRenderer;

impl GridRenderer {
    /// First column date (the Monday of `today`'s week) and the number of
    /// days drawn: `requested_days` plus the days before today in its week,
    /// rounded up to whole weeks.
    pub fn span(requested_days: u32, today: NaiveDate) -> (NaiveDate, u32) {
        let offset = today.weekday().num_days_from_monday();
        let first_date = today - Duration::days(i64::from(offset));
        let total_days = ((requested_days + offset + 6) / 7 * 7).max(7);
        (first_date, total_days)
    }

    /// Lay `events` (sorted by start) out over the weeks covering
    /// `requested_days` from `today`.
    ///
    /// Every day column is padded to the busiest day of the whole range, not
    /// of its own week.
    pub fn render(events: &[NormalizedEvent], requested_days: u32, today: NaiveDate) -> GridModel {
        let (first_date, total_days) = Self::span(requested_days, today);

        let mut per_day: Vec<Vec<&NormalizedEvent>> = vec![Vec::new(); total_days as usize];
        for event in events {
            let index = (event.start.date() - first_date).num_days();
            if (0..i64::from(total_days)).contains(&index) {
                per_day[index as usize].push(event);
            }
        }

        let rows_per_week = per_day.iter().map(Vec::len).max().unwrap_or(0);

        let mut cells = Vec::new();
        for week in 0..(total_days as usize / 7) {
            let days = week * 7..week * 7 + 7;

            cells.push(
                days.clone()
                    .map(|day| {
                        let date = first_date + Duration::days(day as i64);
                        Cell {
                            text: date.format("%d.%m.").to_string(),
                            color: (if date == today { TODAY_COLOR } else { LABEL_COLOR })
                                .to_string(),
                        }
                    })
                    .collect(),
            );

            for row in 0..rows_per_week {
                cells.push(
                    days.clone()
                        .map(|day| match per_day[day].get(row) {
                            Some(event) => event_cell(event),
                            None => Cell::empty(),
                        })
                        .collect(),
                );
            }
        }

        GridModel {
            column_headers: (1..=7).map(i18n::weekday_name).collect(),
            first_date,
            total_days,
            rows_per_week,
            cells,
        }
    }
}

fn event_cell(event: &NormalizedEvent) -> Cell {
    let text = if event.all_day {
        event.title_or_default().to_string()
    } else {
        format!("{} {}", event.start.format("%H:%M"), event.title_or_default())
    };
    Cell {
        text,
        color: event.calendar_color.clone(),
    }
}

fn fit(text: &str, width: usize) -> String {
    let len = text.chars().count();
    if len <= width {
        format!("{}{}", text, " ".repeat(width - len))
    } else {
        let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
        cut.push('~');
        cut
    }
}

impl GridModel {
    /// Draw the grid as a fixed-width table, suitable for a code block.
    /// Week blocks are separated by a rule line.
    pub fn to_text_table(&self) -> String {
        let mut widths: Vec<usize> = self
            .column_headers
            .iter()
            .map(|h| h.chars().count())
            .collect();
        for row in &self.cells {
            for (col, cell) in row.iter().enumerate() {
                widths[col] = widths[col].max(cell.text.chars().count());
            }
        }
        for width in widths.iter_mut() {
            *width = (*width).min(MAX_COLUMN_WIDTH);
        }

        let rule: String = widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+");
        let rule = format!("+{}+\n", rule);

        let draw_row = |texts: Vec<&str>| -> String {
            let inner = texts
                .iter()
                .zip(&widths)
                .map(|(text, width)| format!(" {} ", fit(text, *width)))
                .collect::<Vec<_>>()
                .join("|");
            format!("|{}|\n", inner)
        };

        let mut out = String::new();
        out.push_str(&rule);
        out.push_str(&draw_row(
            self.column_headers.iter().map(String::as_str).collect(),
        ));

        let block = self.rows_per_week + 1;
        for (index, row) in self.cells.iter().enumerate() {
            if index % block == 0 {
                out.push_str(&rule);
            }
            out.push_str(&draw_row(row.iter().map(|c| c.text.as_str()).collect()));
        }
        out.push_str(&rule);
        out
    }
}

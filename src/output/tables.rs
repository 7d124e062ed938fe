use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use crate::report::StepStatus;

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn status_cell(status: StepStatus) -> Cell {
    match status {
        StepStatus::Succeeded => Cell::new("ok").fg(TableColor::Green),
        StepStatus::Failed => Cell::new("failed").fg(TableColor::Red),
        StepStatus::Skipped => Cell::new("skipped").fg(TableColor::DarkGrey),
    }
}

pub fn color_coded_duration_cell(seconds: f64) -> Cell {
    let text = if seconds >= 60.0 {
        format!("{:.1}min", seconds / 60.0)
    } else {
        format!("{seconds:.1}s")
    };
    let minutes = seconds / 60.0;
    if minutes <= 10.0 {
        Cell::new(text).fg(TableColor::Green)
    } else if minutes <= 30.0 {
        Cell::new(text).fg(TableColor::Yellow)
    } else {
        Cell::new(text).fg(TableColor::Red)
    }
}

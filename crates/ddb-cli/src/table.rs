use std::io::IsTerminal;

use comfy_table::presets::{NOTHING, UTF8_HORIZONTAL_ONLY};
use comfy_table::{Attribute, Cell, CellAlignment, Color, Table};

/// How `ddbctl` renders tables: box drawing and colour only on a terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CliTableTheme {
    pub use_unicode: bool,
    pub use_color: bool,
}

impl CliTableTheme {
    pub(crate) fn detect() -> Self {
        theme_for(
            std::io::stdout().is_terminal(),
            std::env::var_os("NO_COLOR").is_some(),
        )
    }

    /// Column table for listings such as `ddbctl status`.
    pub(crate) fn new_data_table(self, headers: &[&str]) -> Table {
        let mut table = Table::new();
        table.load_preset(if self.use_unicode {
            UTF8_HORIZONTAL_ONLY
        } else {
            NOTHING
        });
        table.set_header(headers.iter().map(|h| self.label(h)).collect::<Vec<_>>());
        table
    }

    /// Two-column "field: value" table for a single store.
    pub(crate) fn new_kv_table(self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table
    }

    fn label(self, text: &str) -> Cell {
        let cell = Cell::new(text);
        if self.use_color {
            cell.add_attribute(Attribute::Bold)
        } else {
            cell
        }
    }

    /// Right-aligned numeric cell (volume counts, sizes).
    pub(crate) fn count(self, value: impl ToString) -> Cell {
        Cell::new(value.to_string()).set_alignment(CellAlignment::Right)
    }

    /// Cell that is highlighted when the store needs operator attention
    /// (resync pending, recovery pending, sealed).
    pub(crate) fn flagged(self, text: impl ToString, raised: bool) -> Cell {
        let cell = Cell::new(text.to_string());
        if raised && self.use_color {
            cell.fg(Color::Yellow)
        } else {
            cell
        }
    }
}

fn theme_for(is_tty: bool, no_color: bool) -> CliTableTheme {
    CliTableTheme {
        use_unicode: is_tty,
        use_color: is_tty && !no_color,
    }
}

pub(crate) fn add_kv_row(
    table: &mut Table,
    theme: CliTableTheme,
    field: &str,
    value: impl ToString,
) {
    table.add_row(vec![theme.label(field), Cell::new(value.to_string())]);
}

#[cfg(test)]
mod tests {
    use comfy_table::presets::{NOTHING, UTF8_HORIZONTAL_ONLY};

    use super::theme_for;

    #[test]
    fn color_needs_a_terminal_and_no_no_color() {
        assert!(theme_for(true, false).use_color);
        assert!(!theme_for(true, true).use_color);
        assert!(!theme_for(false, false).use_color);
    }

    #[test]
    fn store_listing_is_plain_when_piped() {
        let mut table = theme_for(false, false).new_data_table(&["ID", "Name"]);
        assert_eq!(table.current_style_as_preset(), NOTHING);
    }

    #[test]
    fn store_listing_draws_rules_on_a_terminal() {
        let mut table = theme_for(true, true).new_data_table(&["ID", "Name"]);
        assert_eq!(table.current_style_as_preset(), UTF8_HORIZONTAL_ONLY);
    }

    #[test]
    fn flagged_cell_text_is_unchanged_without_color() {
        let theme = theme_for(false, false);
        assert_eq!(theme.flagged("needed", true).content(), "needed");
    }
}

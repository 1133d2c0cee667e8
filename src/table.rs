//! Markdown (pipe) table rendering for reports
//!
//! ```text
//! | Fruit   | Cost   | Colour    |
//! |:--------|:-------|:----------|
//! | Apples  | 40p    | Red/green |
//! | Oranges | 50p    | Orange    |
//! ```

pub struct MarkdownTable {
    index_name: String,
    columns: Vec<String>,
    rows: Vec<(String, Vec<(String, String)>)>,
}

impl MarkdownTable {
    pub fn new(index_name: &str) -> Self {
        Self {
            index_name: index_name.to_string(),
            columns: vec![],
            rows: vec![],
        }
    }

    /// Adds a row. Columns appear in the order they are first seen across rows.
    pub fn push_row(self: &mut Self, index: String, cells: Vec<(String, String)>) {
        for (column, _) in &cells {
            if !self.columns.contains(column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push((index, cells));
    }

    pub fn render(self: &Self) -> String {
        let mut grid: Vec<Vec<&str>> = vec![];

        let mut header = vec![self.index_name.as_str()];
        header.extend(self.columns.iter().map(String::as_str));
        grid.push(header);

        for (index, cells) in &self.rows {
            let mut line = vec![index.as_str()];
            for column in &self.columns {
                let cell = cells
                    .iter()
                    .find(|(c, _)| c == column)
                    .map(|(_, v)| v.as_str())
                    .unwrap_or("");
                line.push(cell);
            }
            grid.push(line);
        }

        // Headers keep two columns of breathing room, as tabulate does
        let widths: Vec<usize> = (0..=self.columns.len())
            .map(|i| {
                let cells = grid[1..].iter().map(|row| row[i].chars().count());
                cells.fold(grid[0][i].chars().count() + 2, usize::max)
            })
            .collect();

        let format_line = |row: &[&str]| {
            let cells = row
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!(" {cell:<width$} "))
                .collect::<Vec<_>>();
            format!("|{}|", cells.join("|"))
        };

        let mut lines = vec![format_line(&grid[0])];
        let rule = widths
            .iter()
            .map(|width| format!(":{}", "-".repeat(width + 1)))
            .collect::<Vec<_>>();
        lines.push(format!("|{}|", rule.join("|")));
        lines.extend(grid[1..].iter().map(|row| format_line(row)));

        lines.join("\n")
    }
}

use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print left-aligned columns separated by two spaces. The last column is
/// not padded.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let separator: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", format_row(&header, &widths));
    println!("{}", format_row(&separator, &widths));
    for row in rows {
        println!("{}", format_row(row, &widths));
    }
}

fn format_row(cells: &[String], widths: &[usize]) -> String {
    let last = cells.len().saturating_sub(1);
    cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            if i == last {
                cell.clone()
            } else {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{cell:w$}")
            }
        })
        .collect::<Vec<_>>()
        .join("  ")
}

/// Shorten `text` to at most `max` characters, marking the cut with `...`.
pub fn truncate(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.chars().count() <= max && !text.contains('\n') {
        return first_line.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = first_line.chars().take(keep).collect();
    out.push_str("...");
    out
}

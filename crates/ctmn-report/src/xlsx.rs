use anyhow::{Context, Result};
use rust_xlsxwriter::{Format, Workbook};

use crate::Table;

/// Writes `table` to a single-sheet workbook: bold header row, link cells as
/// hyperlinks labelled with the cell text.
pub fn table_to_xlsx(table: &Table) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Sheet1").context("naming worksheet")?;

    for (col, header) in table.headers.iter().enumerate() {
        sheet
            .write_string_with_format(0, col_index(col)?, header.as_str(), &bold)
            .context("writing header")?;
    }
    for (r, row) in table.rows.iter().enumerate() {
        let row_num = u32::try_from(r + 1).context("too many rows for a worksheet")?;
        for (col, cell) in row.iter().enumerate() {
            let col = col_index(col)?;
            if cell.is_link() {
                sheet
                    .write_url_with_text(row_num, col, cell.href.as_str(), cell.text.as_str())
                    .with_context(|| format!("writing link {:?}", cell.href))?;
            } else {
                sheet
                    .write_string(row_num, col, cell.text.as_str())
                    .context("writing cell")?;
            }
        }
    }
    sheet.autofit();

    workbook.save_to_buffer().context("serialising workbook")
}

fn col_index(col: usize) -> Result<u16> {
    u16::try_from(col).context("too many columns for a worksheet")
}

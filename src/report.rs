use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, TimeDelta};
use rust_xlsxwriter::Workbook;
use tracing::{debug, info, warn};

use crate::dataset::{CellValue, ColumnKind, Dataset, build_column, parse_timestamp};
use crate::domain::SheetError;
use crate::workbook::{self, TableLayout, TotalsRow};

pub const DEFAULT_OUTPUT: &str = "Planilha_Custos_Empresas.xlsx";
const DATE_COLUMNS: [&str; 2] = ["Data", "Date"];
const CURRENCY_COLUMNS: [&str; 2] = ["Empresa 1 (R$)", "Empresa 2 (R$)"];
const TOTALS_LABEL: &str = "Totais";
const MAX_SHEET_NAME: usize = 31;

#[derive(Debug, Default)]
pub struct ReportSummary {
    pub output: PathBuf,
    pub processed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Positions of the columns a cost sheet must have.
#[derive(Debug, PartialEq)]
struct CostColumns {
    date: usize,
    currency: [usize; 2],
}

impl CostColumns {
    fn locate(dataset: &Dataset) -> Option<Self> {
        let date = DATE_COLUMNS
            .iter()
            .find_map(|name| dataset.column_index(name))?;
        let first = dataset.column_index(CURRENCY_COLUMNS[0])?;
        let second = dataset.column_index(CURRENCY_COLUMNS[1])?;
        Some(CostColumns {
            date,
            currency: [first, second],
        })
    }
}

/// Reads every sheet of `input` and writes one report sheet per cost sheet to `output`.
/// Nothing is written when no sheet qualifies.
pub fn generate_report(input: &Path, output: &Path) -> Result<ReportSummary, SheetError> {
    println!("Reading sheets from {}", input.display());
    let sheets = workbook::read_sheets(input)?;
    let names: Vec<&str> = sheets.iter().map(|(name, _)| name.as_str()).collect();
    println!("{} sheet(s) found: {}", sheets.len(), names.join(", "));

    let mut summary = ReportSummary {
        output: output.to_path_buf(),
        ..Default::default()
    };
    let mut report = Workbook::new();
    let mut table_names = HashSet::new();

    for (name, dataset) in sheets {
        println!("Processing sheet: {name}");
        let Some(columns) = CostColumns::locate(&dataset) else {
            println!("Skipping sheet '{name}': expected columns not found");
            summary.skipped.push(name);
            continue;
        };

        let (dataset, invalid) = coerce_dates(&dataset, columns.date)?;
        if invalid > 0 {
            println!("Sheet '{name}': {invalid} invalid date(s) were left empty");
            warn!("{invalid} invalid dates in sheet '{name}'");
        }

        let layout = TableLayout {
            table_name: unique_table_name(&name, &mut table_names),
            totals: Some(TotalsRow {
                label: TOTALS_LABEL.to_string(),
                sum_columns: columns.currency.to_vec(),
            }),
            autofit: true,
        };
        let worksheet = report.add_worksheet();
        worksheet
            .set_name(sheet_title(&name))
            .map_err(|e| SheetError::write(output, e))?;
        workbook::write_table(worksheet, &dataset, &layout)?;
        debug!("Sheet '{name}' written as table {}", layout.table_name);
        summary.processed.push(name);
    }

    if summary.processed.is_empty() {
        println!("No valid sheet was processed, no file generated.");
        return Err(SheetError::NoQualifyingSheets(input.to_path_buf()));
    }

    report.save(output).map_err(|e| SheetError::write(output, e))?;
    println!("Report generated: {}", output.display());
    info!(
        "Report {}: {} processed, {} skipped",
        output.display(),
        summary.processed.len(),
        summary.skipped.len()
    );
    Ok(summary)
}

/// Turns the date column into a timestamp column. Text that is not a date and
/// anything else unreadable becomes missing; the count of such cells is returned.
fn coerce_dates(dataset: &Dataset, column: usize) -> Result<(Dataset, usize), SheetError> {
    if dataset.column_kind(column) == Some(ColumnKind::Timestamp) {
        return Ok((dataset.clone(), 0));
    }
    let mut invalid = 0;
    let values: Vec<CellValue> = dataset
        .column_values(column)?
        .into_iter()
        .map(|value| {
            let coerced = match &value {
                CellValue::Missing => return CellValue::Missing,
                CellValue::Timestamp(ts) => Some(*ts),
                CellValue::Text(s) => parse_timestamp(s),
                CellValue::Integer(n) => excel_serial(*n as f64),
                CellValue::Float(f) => excel_serial(*f),
            };
            coerced.map_or_else(
                || {
                    invalid += 1;
                    CellValue::Missing
                },
                CellValue::Timestamp,
            )
        })
        .collect();

    let name = dataset.column_name(column).unwrap_or_default().to_string();
    let mut frame = dataset.frame().clone();
    frame.with_column(build_column(&name, ColumnKind::Timestamp, &values)?)?;
    Ok((Dataset::with_frame(frame), invalid))
}

/// Days since 1899-12-30, the spreadsheet date epoch.
fn excel_serial(days: f64) -> Option<chrono::NaiveDateTime> {
    if !days.is_finite() || days < 0.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (days * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(TimeDelta::try_milliseconds(millis)?)
}

fn sheet_title(name: &str) -> String {
    name.chars().take(MAX_SHEET_NAME).collect()
}

fn unique_table_name(sheet: &str, taken: &mut HashSet<String>) -> String {
    let safe: String = sheet
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let base = format!("Tabela_{safe}");
    let mut name = base.clone();
    let mut suffix = 2;
    while !taken.insert(name.clone()) {
        name = format!("{base}_{suffix}");
        suffix += 1;
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{Reader, Xlsx, open_workbook};

    fn write_input(path: &Path) {
        let mut book = Workbook::new();
        let costs = book.add_worksheet().set_name("Janeiro").unwrap();
        for (col, header) in ["Data", "Empresa 1 (R$)", "Empresa 2 (R$)", "Obs"].iter().enumerate() {
            costs.write_string(0, col as u16, *header).unwrap();
        }
        costs.write_string(1, 0, "2025-01-05").unwrap();
        costs.write_number(1, 1, 100.5).unwrap();
        costs.write_number(1, 2, 20.0).unwrap();
        costs.write_string(1, 3, "rent").unwrap();
        costs.write_string(2, 0, "not a date").unwrap();
        costs.write_number(2, 1, 10.0).unwrap();
        costs.write_number(2, 2, 5.0).unwrap();

        let notes = book.add_worksheet().set_name("Notes").unwrap();
        notes.write_string(0, 0, "Anything").unwrap();
        notes.write_string(1, 0, "else").unwrap();
        book.save(path).unwrap();
    }

    #[test]
    fn writes_only_qualifying_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.xlsx");
        let output = dir.path().join("report.xlsx");
        write_input(&input);

        let summary = generate_report(&input, &output).unwrap();
        assert_eq!(summary.processed, vec!["Janeiro"]);
        assert_eq!(summary.skipped, vec!["Notes"]);
        assert!(output.exists());

        let sheets = workbook::read_sheets(&output).unwrap();
        assert_eq!(sheets.len(), 1);
        let (name, data) = &sheets[0];
        assert_eq!(name, "Janeiro");
        assert_eq!(
            data.column_names(),
            vec!["Data", "Empresa 1 (R$)", "Empresa 2 (R$)", "Obs"]
        );
        // two data rows and the totals row
        assert_eq!(data.row_count(), 3);
        assert_eq!(data.value(2, 0).unwrap(), CellValue::Text("Totais".into()));
    }

    #[test]
    fn totals_row_sums_the_cost_columns() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.xlsx");
        let output = dir.path().join("report.xlsx");
        write_input(&input);
        generate_report(&input, &output).unwrap();

        let mut book: Xlsx<_> = open_workbook(&output).unwrap();
        let formulas = book.worksheet_formula("Janeiro").unwrap();
        assert_eq!(
            formulas.get_value((3, 1)).map(String::as_str),
            Some("SUBTOTAL(109,[Empresa 1 (R$)])")
        );
        assert_eq!(
            formulas.get_value((3, 2)).map(String::as_str),
            Some("SUBTOTAL(109,[Empresa 2 (R$)])")
        );
        assert!(formulas.get_value((3, 0)).is_none_or(|f| f.is_empty()));
        assert!(formulas.get_value((3, 3)).is_none_or(|f| f.is_empty()));
    }

    #[test]
    fn report_widths_fit_the_longest_text() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.xlsx");
        write_input(&input);
        let sheets = workbook::read_sheets(&input).unwrap();
        let (_, dataset) = &sheets[0];
        let columns = CostColumns::locate(dataset).unwrap();
        let (dataset, _) = coerce_dates(dataset, columns.date).unwrap();
        let totals = TotalsRow {
            label: TOTALS_LABEL.to_string(),
            sum_columns: columns.currency.to_vec(),
        };
        // The label sits in the date column, which its timestamps already widen.
        assert_eq!(
            workbook::autofit_widths(&dataset, Some(&totals)).unwrap(),
            vec![21, 16, 16, 6]
        );
    }

    #[test]
    fn label_moves_past_leading_cost_columns() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.xlsx");
        let output = dir.path().join("report.xlsx");
        let mut book = Workbook::new();
        let sheet = book.add_worksheet().set_name("Fevereiro").unwrap();
        for (col, header) in ["Empresa 1 (R$)", "Empresa 2 (R$)", "Data"].iter().enumerate() {
            sheet.write_string(0, col as u16, *header).unwrap();
        }
        sheet.write_number(1, 0, 7.0).unwrap();
        sheet.write_number(1, 1, 3.0).unwrap();
        sheet.write_string(1, 2, "2025-02-01").unwrap();
        book.save(&input).unwrap();

        generate_report(&input, &output).unwrap();

        let sheets = workbook::read_sheets(&output).unwrap();
        let (_, data) = &sheets[0];
        assert_eq!(data.row_count(), 2);
        assert_eq!(data.value(1, 2).unwrap(), CellValue::Text("Totais".into()));

        let mut book: Xlsx<_> = open_workbook(&output).unwrap();
        let formulas = book.worksheet_formula("Fevereiro").unwrap();
        assert_eq!(
            formulas.get_value((2, 0)).map(String::as_str),
            Some("SUBTOTAL(109,[Empresa 1 (R$)])")
        );
        assert_eq!(
            formulas.get_value((2, 1)).map(String::as_str),
            Some("SUBTOTAL(109,[Empresa 2 (R$)])")
        );
    }

    #[test]
    fn no_qualifying_sheet_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.xlsx");
        let output = dir.path().join("report.xlsx");
        let mut book = Workbook::new();
        book.add_worksheet()
            .set_name("Other")
            .unwrap()
            .write_string(0, 0, "Date")
            .unwrap();
        book.save(&input).unwrap();

        assert!(matches!(
            generate_report(&input, &output),
            Err(SheetError::NoQualifyingSheets(_))
        ));
        assert!(!output.exists());
    }

    #[test]
    fn locates_cost_columns_by_name() {
        let ds = Dataset::from_columns([
            ("Empresa 2 (R$)", ColumnKind::Float, vec![]),
            ("Date", ColumnKind::Timestamp, vec![]),
            ("Empresa 1 (R$)", ColumnKind::Float, vec![]),
        ])
        .unwrap();
        assert_eq!(
            CostColumns::locate(&ds),
            Some(CostColumns { date: 1, currency: [2, 0] })
        );
        let partial = Dataset::from_columns([("Data", ColumnKind::Timestamp, vec![])]).unwrap();
        assert_eq!(CostColumns::locate(&partial), None);
    }

    #[test]
    fn dates_are_coerced_and_invalid_ones_counted() {
        let ds = Dataset::from_columns([(
            "Data",
            ColumnKind::Text,
            vec![
                CellValue::Text("2025-01-05".into()),
                CellValue::Text("soon".into()),
                CellValue::Missing,
            ],
        )])
        .unwrap();
        let (coerced, invalid) = coerce_dates(&ds, 0).unwrap();
        assert_eq!(invalid, 1);
        assert_eq!(coerced.column_kind(0), Some(ColumnKind::Timestamp));
        assert_eq!(
            coerced.value(0, 0).unwrap().to_string(),
            "2025-01-05 00:00:00"
        );
        assert_eq!(coerced.value(1, 0).unwrap(), CellValue::Missing);
    }

    #[test]
    fn serial_numbers_are_spreadsheet_dates() {
        let ts = excel_serial(45_658.5).unwrap();
        assert_eq!(ts.to_string(), "2025-01-01 12:00:00");
        assert_eq!(excel_serial(-1.0), None);
    }

    #[test]
    fn names_are_made_safe() {
        assert_eq!(sheet_title(&"x".repeat(40)).len(), 31);
        let mut taken = HashSet::new();
        assert_eq!(unique_table_name("Custos 2025", &mut taken), "Tabela_Custos_2025");
        assert_eq!(unique_table_name("Custos-2025", &mut taken), "Tabela_Custos_2025_2");
    }
}

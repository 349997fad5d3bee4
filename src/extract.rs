//! Multi-format text extraction for knowledge-base files.
//!
//! Dispatch is keyed on the lowercased file extension. Prose formats
//! produce one text string; spreadsheets additionally support an index
//! mode that emits one semantic record per data row (see
//! [`excel_index_records`]), which is what makes row-oriented queries
//! against spreadsheets retrievable at all.
//!
//! Extraction failures are typed ([`ExtractError`]); the ingestion
//! pipeline records the file as `error` and moves on.

use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::events::Event;
use thiserror::Error;

/// Extensions accepted by the scanner and uploader.
pub const SUPPORTED_EXTENSIONS: [&str; 7] = ["txt", "md", "pdf", "docx", "xlsx", "xls", "csv"];

/// Per-sheet row cap: 1000 rows per MB of file size, clamped to
/// [1000, 200000].
pub fn row_cap(file_size: i64) -> usize {
    let cap = (file_size / (1024 * 1024)) as usize * 1000;
    cap.clamp(1000, 200_000)
}

/// Decompression bound per ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file extension: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("CSV extraction failed: {0}")]
    Csv(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, ExtractError>;

/// Lowercased extension without the dot, empty when absent.
pub fn file_ext(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

pub fn is_supported_ext(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&ext)
}

/// Full-text extraction for previews and file attachments. Spreadsheets
/// render as per-sheet Markdown tables.
pub fn file_content(path: &Path) -> Result<String> {
    match file_ext(path).as_str() {
        "pdf" => extract_pdf(path),
        "docx" => extract_docx(path),
        "xlsx" | "xls" => excel_preview(path),
        "csv" => csv_preview(path),
        _ => {
            let bytes = std::fs::read(path)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

fn extract_pdf(path: &Path) -> Result<String> {
    pdf_extract::extract_text(path).map_err(|e| ExtractError::Pdf(e.to_string()))
}

// ============ DOCX ============

/// Extract the document body: `w:t` runs concatenated, paragraph
/// boundaries preserved as newlines.
fn extract_docx(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice()))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let xml = read_zip_entry(&mut archive, "word/document.xml")?;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(Event::Text(t)) if in_t => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {name} exceeds size limit"
        )));
    }
    Ok(out)
}

// ============ XLSX ============

/// One worksheet as raw rows of cell strings. The first row is the
/// header row by convention.
#[derive(Debug)]
pub struct SheetTable {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

/// Read every worksheet into row/cell strings, capped at `max_rows` rows
/// per sheet (header included).
pub fn read_excel_tables(path: &Path, max_rows: usize) -> Result<Vec<SheetTable>> {
    let bytes = std::fs::read(path)?;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice()))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;

    let shared = read_shared_strings(&mut archive)?;
    let sheet_names = workbook_sheet_names(&mut archive);
    let worksheet_files = list_worksheet_files(&archive);

    let mut tables = Vec::new();
    for (idx, file) in worksheet_files.into_iter().enumerate() {
        let xml = read_zip_entry(&mut archive, &file)?;
        let rows = parse_sheet_rows(&xml, &shared, max_rows)?;
        let name = sheet_names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", idx + 1));
        tables.push(SheetTable { name, rows });
    }
    Ok(tables)
}

/// Sheet names in workbook order. Failures degrade to generated names.
fn workbook_sheet_names(archive: &mut zip::ZipArchive<Cursor<&[u8]>>) -> Vec<String> {
    let Ok(xml) = read_zip_entry(archive, "xl/workbook.xml") else {
        return Vec::new();
    };
    let mut names = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"sheet" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"name" {
                            names.push(String::from_utf8_lossy(&attr.value).into_owned());
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    names
}

/// Missing `sharedStrings.xml` is normal for all-numeric workbooks.
fn read_shared_strings(archive: &mut zip::ZipArchive<Cursor<&[u8]>>) -> Result<Vec<String>> {
    let xml = match read_zip_entry(archive, "xl/sharedStrings.xml") {
        Ok(xml) => xml,
        Err(_) => return Ok(Vec::new()),
    };
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_t => {
                current.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_files(archive: &zip::ZipArchive<Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

#[derive(Clone, Copy, PartialEq)]
enum CellType {
    Plain,
    Shared,
    InlineStr,
}

/// Column index from a cell reference like `C5` (A → 0).
fn column_index(cell_ref: &[u8]) -> Option<usize> {
    let mut col = 0usize;
    let mut seen = false;
    for &b in cell_ref {
        if b.is_ascii_uppercase() {
            col = col * 26 + (b - b'A' + 1) as usize;
            seen = true;
        } else {
            break;
        }
    }
    seen.then(|| col - 1)
}

fn parse_sheet_rows(
    xml: &[u8],
    shared: &[String],
    max_rows: usize,
) -> Result<Vec<Vec<String>>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut cur_col = 0usize;
    let mut cell_type = CellType::Plain;
    let mut in_v = false;
    let mut in_inline_t = false;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"row" => {
                    current.clear();
                }
                b"c" => {
                    cur_col = current.len();
                    cell_type = CellType::Plain;
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"r" => {
                                if let Some(col) = column_index(&attr.value) {
                                    cur_col = col;
                                }
                            }
                            b"t" => {
                                cell_type = match attr.value.as_ref() {
                                    b"s" => CellType::Shared,
                                    b"inlineStr" => CellType::InlineStr,
                                    _ => CellType::Plain,
                                };
                            }
                            _ => {}
                        }
                    }
                }
                b"v" => in_v = true,
                b"t" if cell_type == CellType::InlineStr => in_inline_t = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_v || in_inline_t => {
                let raw = t.unescape().unwrap_or_default();
                let value = if in_v && cell_type == CellType::Shared {
                    raw.trim()
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i))
                        .cloned()
                        .unwrap_or_default()
                } else {
                    raw.into_owned()
                };
                while current.len() < cur_col {
                    current.push(String::new());
                }
                if current.len() == cur_col {
                    current.push(value);
                } else {
                    current[cur_col].push_str(&value);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"t" => in_inline_t = false,
                b"row" => {
                    rows.push(std::mem::take(&mut current));
                    if rows.len() >= max_rows {
                        break;
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

/// Markdown-table preview: sticky header per sheet, empty rows skipped,
/// sheets separated by a rule.
pub fn excel_preview(path: &Path) -> Result<String> {
    let size = std::fs::metadata(path)?.len() as i64;
    let tables = read_excel_tables(path, row_cap(size))?;

    let mut out = String::new();
    for table in &tables {
        out.push_str("工作表: ");
        out.push_str(&table.name);
        out.push('\n');

        if let Some(headers) = table.rows.first() {
            out.push_str("| ");
            for h in headers {
                out.push_str(h);
                out.push_str(" | ");
            }
            out.push('\n');
            out.push_str("| ");
            for h in headers {
                out.push_str(&"-".repeat(h.len().max(1)));
                out.push_str(" | ");
            }
            out.push('\n');
        }

        for row in table.rows.iter().skip(1) {
            if row.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            out.push_str("| ");
            for cell in row {
                out.push_str(cell);
                out.push_str(" | ");
            }
            out.push('\n');
        }

        out.push('\n');
        out.push_str(&"-".repeat(80));
        out.push_str("\n\n");
    }
    Ok(out)
}

/// Row-semantic index records, grouped per sheet.
///
/// Each non-empty data row becomes
/// `工作表: <sheet>；行: <n>；<header>: <value>；…` with empty header
/// cells renamed `列N`. Row numbers are 1-based and include the header
/// row, matching what a user sees in a spreadsheet UI.
pub fn excel_index_records(path: &Path) -> Result<Vec<Vec<String>>> {
    let size = std::fs::metadata(path)?.len() as i64;
    let tables = read_excel_tables(path, row_cap(size))?;

    let mut groups = Vec::new();
    for table in &tables {
        let Some(header_row) = table.rows.first() else {
            continue;
        };
        let headers: Vec<String> = header_row
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = h.trim();
                if h.is_empty() {
                    format!("列{}", i + 1)
                } else {
                    h.to_string()
                }
            })
            .collect();

        let mut records = Vec::new();
        for (idx, row) in table.rows.iter().enumerate().skip(1) {
            if row.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            let mut line = format!("工作表: {}；行: {}；", table.name, idx + 1);
            for (i, cell) in row.iter().enumerate().take(headers.len()) {
                let v = cell.trim();
                if v.is_empty() {
                    continue;
                }
                line.push_str(&headers[i]);
                line.push_str(": ");
                line.push_str(v);
                line.push('；');
            }
            let record = line.trim().to_string();
            if !record.is_empty() {
                records.push(record);
            }
        }
        groups.push(records);
    }
    Ok(groups)
}

// ============ CSV ============

/// Markdown-table preview of a CSV file, same shape as the Excel preview.
pub fn csv_preview(path: &Path) -> Result<String> {
    let size = std::fs::metadata(path)?.len() as i64;
    let max_rows = row_cap(size);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| ExtractError::Csv(e.to_string()))?;

    let mut out = String::new();
    out.push_str("CSV文件: ");
    out.push_str(
        &path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    out.push('\n');

    let mut records = reader.records();
    if let Some(Ok(headers)) = records.next() {
        out.push_str("| ");
        for h in headers.iter() {
            out.push_str(h);
            out.push_str(" | ");
        }
        out.push('\n');
        out.push_str("| ");
        for h in headers.iter() {
            out.push_str(&"-".repeat(h.len().max(1)));
            out.push_str(" | ");
        }
        out.push('\n');
    }

    let mut row_count = 2usize;
    for record in records {
        if row_count > max_rows {
            break;
        }
        let Ok(record) = record else {
            continue;
        };
        row_count += 1;
        if record.iter().all(|c| c.is_empty()) {
            continue;
        }
        out.push_str("| ");
        for cell in record.iter() {
            out.push_str(cell);
            out.push_str(" | ");
        }
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&"-".repeat(80));
    out.push_str("\n\n");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_cap_clamps() {
        assert_eq!(row_cap(0), 1000);
        assert_eq!(row_cap(5 * 1024 * 1024), 5000);
        assert_eq!(row_cap(500 * 1024 * 1024), 200_000);
    }

    #[test]
    fn extension_filter() {
        assert!(is_supported_ext("txt"));
        assert!(is_supported_ext("xlsx"));
        assert!(!is_supported_ext("exe"));
        assert_eq!(file_ext(Path::new("/a/b/Report.XLSX")), "xlsx");
        assert_eq!(file_ext(Path::new("/a/b/noext")), "");
    }

    #[test]
    fn column_index_parses_refs() {
        assert_eq!(column_index(b"A1"), Some(0));
        assert_eq!(column_index(b"C5"), Some(2));
        assert_eq!(column_index(b"AA10"), Some(26));
        assert_eq!(column_index(b"7"), None);
    }

    #[test]
    fn invalid_zip_is_an_ooxml_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        std::fs::write(&path, b"not a zip").unwrap();
        let err = extract_docx(&path).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn sheet_rows_resolve_shared_and_inline_strings() {
        let xml = br#"<?xml version="1.0"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
  <sheetData>
    <row r="1">
      <c r="A1" t="s"><v>0</v></c>
      <c r="B1" t="s"><v>1</v></c>
    </row>
    <row r="2">
      <c r="A2" t="inlineStr"><is><t>Zhang</t></is></c>
      <c r="C2"><v>42</v></c>
    </row>
  </sheetData>
</worksheet>"#;
        let shared = vec!["Name".to_string(), "Score".to_string()];
        let rows = parse_sheet_rows(xml, &shared, 1000).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["Name", "Score"]);
        assert_eq!(rows[1], vec!["Zhang", "", "42"]);
    }

    #[test]
    fn sheet_rows_honor_the_cap() {
        let mut xml = String::from(
            r#"<?xml version="1.0"?><worksheet><sheetData>"#,
        );
        for i in 1..=10 {
            xml.push_str(&format!(r#"<row r="{i}"><c r="A{i}"><v>{i}</v></c></row>"#));
        }
        xml.push_str("</sheetData></worksheet>");
        let rows = parse_sheet_rows(xml.as_bytes(), &[], 4).unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn csv_preview_renders_markdown_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grades.csv");
        std::fs::write(&path, "name,score\nZhang,92\nLi,85\n").unwrap();
        let out = csv_preview(&path).unwrap();
        assert!(out.starts_with("CSV文件: grades.csv\n"));
        assert!(out.contains("| name | score | "));
        assert!(out.contains("| Zhang | 92 | "));
    }
}

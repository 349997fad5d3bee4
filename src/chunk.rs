//! Text segmentation.
//!
//! Prose formats use a rune-indexed sliding window with overlap; window
//! sizes vary by format because extraction noise differs (PDF text is the
//! noisiest, plain text the cleanest). Spreadsheet index records use a
//! row packer instead: complete row records are appended until the next
//! one would overflow the target, and a row is never split across chunks.

/// Window size and overlap (in runes) for a format extension.
pub fn chunk_params(ext: &str) -> (usize, usize) {
    match ext {
        "pdf" => (1500, 250),
        "docx" => (1200, 200),
        _ => (1000, 150),
    }
}

/// Split `text` into windows of `chunk_size` runes stepping by
/// `chunk_size - overlap`. The final window always ends exactly at the
/// end of the text.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if chunk_size == 0 {
        return vec![text.to_string()];
    }
    let overlap = overlap.min(chunk_size - 1);

    let runes: Vec<char> = text.chars().collect();
    let n = runes.len();
    if n == 0 {
        return Vec::new();
    }

    let step = (chunk_size - overlap).max(1);
    let mut chunks = Vec::new();
    let mut i = 0;
    while i < n {
        let end = (i + chunk_size).min(n);
        chunks.push(runes[i..end].iter().collect());
        i += step;
    }
    chunks
}

/// Split with per-format parameters and drop whitespace-only chunks.
pub fn split_for_ext(text: &str, ext: &str) -> Vec<String> {
    let (size, overlap) = chunk_params(ext);
    split_text(text, size, overlap)
        .into_iter()
        .filter(|c| !c.trim().is_empty())
        .collect()
}

/// Target chunk size (in chars) for spreadsheet row packing. Larger
/// files get larger chunks so the embedding pass stays bounded.
pub fn excel_target_chars(file_size: i64, max_rows: usize) -> usize {
    if max_rows >= 20_000 || file_size >= 20 * 1024 * 1024 {
        12_000
    } else if max_rows >= 10_000 || file_size >= 10 * 1024 * 1024 {
        8_000
    } else {
        5_000
    }
}

/// Pack per-sheet row records into chunks of at most roughly
/// `target_chars`. Every chunk starts with a provenance line naming the
/// source file; rows stay whole, and packing restarts at sheet
/// boundaries.
pub fn pack_excel_records(
    sheets: &[Vec<String>],
    file_basename: &str,
    target_chars: usize,
) -> Vec<String> {
    let prefix = format!("数据来源: Excel；文件: {file_basename}\n");
    let mut chunks = Vec::new();

    for records in sheets {
        let mut buf = String::new();
        for record in records {
            if record.is_empty() {
                continue;
            }
            if !buf.is_empty() && buf.len() + record.len() + 1 > target_chars {
                flush(&mut chunks, &mut buf);
            }
            if buf.is_empty() {
                buf.push_str(&prefix);
            }
            buf.push_str(record);
            buf.push('\n');
        }
        flush(&mut chunks, &mut buf);
    }
    chunks
}

fn flush(chunks: &mut Vec<String>, buf: &mut String) {
    let s = buf.trim();
    if !s.is_empty() {
        chunks.push(s.to_string());
    }
    buf.clear();
}

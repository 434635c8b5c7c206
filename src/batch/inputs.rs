//! Input enumeration with chapter-aware ordering

use super::runner::{BatchError, BatchItem, BatchResult};
use regex::Regex;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// A document on disk, identified by its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInput {
    pub id: String,
    pub path: PathBuf,
}

impl BatchInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self { id, path }
    }
}

impl BatchItem for BatchInput {
    fn id(&self) -> &str {
        &self.id
    }
}

fn chinese_chapter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"第([零〇一二两三四五六七八九十百千万\d]+)章").expect("Valid chapter regex")
    })
}

fn numeric_patterns() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [r"(?i)chapter\D*(\d+)", r"^(\d+)", r"(\d+)\D*$"]
            .map(|p| Regex::new(p).expect("Valid chapter number regex"))
    })
}

/// Convert a Chinese (or plain Arabic) numeral to an integer.
///
/// Handles unit forms (`十二`, `一百零五`, `十二万`) and positional digit
/// runs (`一二三`).
pub fn chinese_numeral(text: &str) -> Option<u64> {
    if text.chars().all(|c| c.is_ascii_digit()) {
        return text.parse().ok();
    }

    let mut total = 0u64;
    let mut section = 0u64;
    let mut digits = 0u64;
    for ch in text.chars() {
        let value = match ch {
            '零' | '〇' => 0,
            '一' => 1,
            '二' | '两' => 2,
            '三' => 3,
            '四' => 4,
            '五' => 5,
            '六' => 6,
            '七' => 7,
            '八' => 8,
            '九' => 9,
            '十' => 10,
            '百' => 100,
            '千' => 1000,
            '万' => 10_000,
            d if d.is_ascii_digit() => u64::from(d as u8 - b'0'),
            _ => return None,
        };
        // Overflow yields None so the name sorts with the unnumbered files.
        match value {
            0..=9 => digits = digits.checked_mul(10)?.checked_add(value)?,
            10_000 => {
                let scaled = section.checked_add(digits)?.max(1).checked_mul(value)?;
                total = total.checked_add(scaled)?;
                section = 0;
                digits = 0;
            }
            unit => {
                section = section.checked_add(digits.max(1).checked_mul(unit)?)?;
                digits = 0;
            }
        }
    }
    total.checked_add(section)?.checked_add(digits)
}

/// Chapter number encoded in a file name, if any.
///
/// Tries `第N章`, then `chapterN`, leading digits, and trailing digits.
pub fn chapter_number(file_name: &str) -> Option<u64> {
    if let Some(caps) = chinese_chapter().captures(file_name) {
        if let Some(n) = caps.get(1).and_then(|m| chinese_numeral(m.as_str())) {
            return Some(n);
        }
    }
    numeric_patterns().iter().find_map(|re| {
        re.captures(file_name)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

/// Order by chapter number; unnumbered names sort last, ties by name.
pub fn compare_chapters(a: &str, b: &str) -> Ordering {
    match (chapter_number(a), chapter_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// List the files in `dir` with the given extension, in chapter order.
pub fn enumerate_inputs(dir: &Path, extension: &str) -> BatchResult<Vec<BatchInput>> {
    let wanted = extension.trim_start_matches('.');
    let entries = std::fs::read_dir(dir).map_err(|source| BatchError::InputDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut inputs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BatchError::InputDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let matches = path.is_file()
            && path
                .extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case(wanted))
                .unwrap_or(false);
        if matches {
            inputs.push(BatchInput::new(path));
        }
    }

    inputs.sort_by(|a, b| compare_chapters(&a.id, &b.id));
    Ok(inputs)
}

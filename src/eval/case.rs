use std::{fs, io::Read, path::Path};

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::HarnessError;

/// One scripted turn, as authored in the test table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Blank means "use the default account".
    #[serde(default, rename = "account")]
    pub account_id: Option<String>,
    /// Blank means "let the conversation mode decide".
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// 1-based position within the conversation.
    #[serde(rename = "turn", deserialize_with = "turn_cell")]
    pub turn_index: u32,
    #[serde(rename = "prompt")]
    pub prompt_text: String,
    /// Semicolon-delimited patterns that must all appear in the reply.
    #[serde(default, rename = "keywords")]
    pub keyword_spec: String,
    #[serde(default, rename = "expected")]
    pub expected_text: Option<String>,
    #[serde(default, rename = "use_llm", deserialize_with = "flag_cell")]
    pub use_judge: bool,
}

impl TestCase {
    pub fn new(turn_index: u32, prompt_text: impl Into<String>) -> Self {
        Self {
            account_id: None,
            conversation_id: None,
            turn_index,
            prompt_text: prompt_text.into(),
            keyword_spec: String::new(),
            expected_text: None,
            use_judge: false,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account_id = Some(account.into());
        self
    }

    pub fn with_conversation(mut self, conversation: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation.into());
        self
    }

    pub fn with_keywords(mut self, keywords: impl Into<String>) -> Self {
        self.keyword_spec = keywords.into();
        self
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected_text = Some(expected.into());
        self
    }

    pub fn with_judge(mut self, use_judge: bool) -> Self {
        self.use_judge = use_judge;
        self
    }

    pub fn expected(&self) -> &str {
        self.expected_text.as_deref().unwrap_or_default()
    }

    fn normalize(mut self, row: usize) -> Result<Self, HarnessError> {
        self.account_id = non_blank(self.account_id);
        self.conversation_id = non_blank(self.conversation_id);
        self.expected_text = non_blank(self.expected_text);
        if self.turn_index == 0 {
            return Err(HarnessError::InvalidRow {
                row,
                message: "turn must be 1 or greater".to_string(),
            });
        }
        Ok(self)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// CSV rows arrive as plain text; typed parsing happens in `into_case`.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(default)]
    account: String,
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    turn: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    keywords: String,
    #[serde(default)]
    expected: String,
    #[serde(default)]
    use_llm: String,
}

impl CsvRow {
    fn into_case(self, row: usize) -> Result<TestCase, HarnessError> {
        let turn_index = parse_turn(&self.turn).ok_or_else(|| HarnessError::InvalidRow {
            row,
            message: format!("turn '{}' is not a positive integer", self.turn),
        })?;
        let use_judge = parse_flag(&self.use_llm).ok_or_else(|| HarnessError::InvalidRow {
            row,
            message: format!("use_llm '{}' is not a 0/1 flag", self.use_llm),
        })?;

        TestCase {
            account_id: Some(self.account),
            conversation_id: Some(self.conversation_id),
            turn_index,
            prompt_text: self.prompt,
            keyword_spec: self.keywords,
            expected_text: Some(self.expected),
            use_judge,
        }
        .normalize(row)
    }
}

fn parse_turn(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<u32>() {
        return Some(value);
    }
    // Spreadsheet exports sometimes write integers as "3.0".
    let value = raw.parse::<f64>().ok()?;
    (value.fract() == 0.0 && value >= 0.0 && value <= u32::MAX as f64).then_some(value as u32)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "0.0" | "false" | "no" | "n" => Some(false),
        "1" | "1.0" | "true" | "yes" | "y" => Some(true),
        _ => None,
    }
}

/// A JSON/YAML cell that may hold a number, a boolean or text.
#[derive(Deserialize)]
#[serde(untagged)]
enum Cell {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    fn as_text(&self) -> String {
        match self {
            Cell::Bool(value) => value.to_string(),
            Cell::Int(value) => value.to_string(),
            Cell::Float(value) => format!("{value:?}"),
            Cell::Text(value) => value.clone(),
        }
    }
}

fn turn_cell<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let cell = Cell::deserialize(deserializer)?;
    let turn = match &cell {
        Cell::Bool(_) => None,
        Cell::Int(value) => u32::try_from(*value).ok(),
        Cell::Float(_) | Cell::Text(_) => parse_turn(&cell.as_text()),
    };
    turn.ok_or_else(|| de::Error::custom(format!("turn '{}' is not a positive integer", cell.as_text())))
}

fn flag_cell<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let flag = match Option::<Cell>::deserialize(deserializer)? {
        None => Some(false),
        Some(Cell::Bool(value)) => Some(value),
        Some(cell) => parse_flag(&cell.as_text()),
    };
    flag.ok_or_else(|| de::Error::custom("use_llm is not a 0/1 flag"))
}

pub fn parse_csv_cases(reader: impl Read) -> Result<Vec<TestCase>, HarnessError> {
    let mut table = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(reader);

    let mut cases = Vec::new();
    for (index, record) in table.deserialize::<CsvRow>().enumerate() {
        cases.push(record?.into_case(index + 1)?);
    }
    Ok(cases)
}

/// Load a test table. CSV is the primary format; `.json`, `.yaml` and `.yml`
/// files hold an array of rows with the same column names.
pub fn load_cases(path: impl AsRef<Path>) -> Result<Vec<TestCase>, HarnessError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| HarnessError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let cases: Vec<TestCase> = match ext.as_str() {
        "csv" | "txt" => return parse_csv_cases(bytes.as_slice()),
        "json" => serde_json::from_slice(&bytes)?,
        "yaml" | "yml" => serde_yaml::from_slice(&bytes)?,
        other => return Err(HarnessError::UnsupportedFormat(other.to_string())),
    };

    cases
        .into_iter()
        .enumerate()
        .map(|(index, case)| case.normalize(index + 1))
        .collect()
}

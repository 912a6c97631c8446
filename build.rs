use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

// Only the crate's own sources are policed; vendored or reference trees are not.
const SOURCE_DIRS: [&str; 4] = ["score", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// The kinds of source-hygiene violations this script rejects.
#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWord,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWord => format!(r"(//|/\*|///).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::AllCapsComment => r"(//|/\*|///).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn headline(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => "underscore-prefixed identifiers",
            Rule::ForbiddenWord => "comments with change-log words",
            Rule::StarsInComment => "'**' in regular comments",
            Rule::AllCapsComment => "comments written entirely in uppercase",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Either use the binding (dropping the underscore) or remove it completely."
            }
            Rule::ForbiddenWord => {
                "Comments describe the code as it is. Remove history notes such as 'FIXED' or 'UPDATED'."
            }
            Rule::StarsInComment => "Markdown emphasis belongs in doc comments only.",
            Rule::AllCapsComment => "Rewrite the comment in sentence case or delete it.",
            Rule::AllowDeadCode => "Either use the code or remove it completely.",
        }
    }

    /// Whether a line the regex matched really is a violation.
    fn confirms(self, line: &str) -> bool {
        match self {
            Rule::UnderscorePrefix => !is_comment(line) && !underscore_only_in_strings(line),
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !is_doc_comment(line),
            Rule::AllCapsComment => comment_body(line).is_some_and(|body| {
                let letters: Vec<char> = body.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }),
        }
    }
}

// Collects every confirmed violation in a single file.
struct RuleCollector {
    rule: Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl RuleCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.headline(),
            self.file_path.display()
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.rule.advice()));
        Some(message)
    }
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.confirms(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*")
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// Every underscore run on the line sits between a pair of double quotes.
fn underscore_only_in_strings(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .filter(|(index, _)| index % 2 == 0)
            .all(|(_, outside)| !outside.contains('_') || !has_prefixed_word(outside))
}

fn has_prefixed_word(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.iter().enumerate().any(|(index, &byte)| {
        let starts_word = index == 0 || !is_word_byte(bytes[index - 1]);
        byte == b'_' && starts_word && bytes.get(index + 1).copied().is_some_and(is_word_byte)
    })
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn comment_body(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    for marker in ["///", "//!", "//"] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    let start = line.find("/*")? + 2;
    let rest = &line[start..];
    Some(rest.find("*/").map_or(rest, |end| &rest[..end]).trim())
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan(rule: Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = RuleCollector::new(rule, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(message) = collector.error_message() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=PSIX_BUILD_TIMESTAMP={timestamp}");

    let files = source_files();
    let rules = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::AllCapsComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule, &files) {
            // `eprintln!` is what surfaces the message in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

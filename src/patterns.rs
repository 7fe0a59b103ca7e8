//! Attack-signature matching engine.
//!
//! Compiles the built-in signature library into a single Aho-Corasick
//! automaton (literal signatures, pre-lowercased) plus per-category
//! case-insensitive regexes, and answers pure match/no-match queries per
//! category. The same library is consumed by the blocking guard and the
//! observe-only detector so the two layers can never drift apart.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// Signature category. The set is fixed; the signature lists behind each
/// category are maintained in `signature_library`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    LdapInjection,
    XmlInjection,
}

impl PatternCategory {
    pub const ALL: [PatternCategory; 6] = [
        PatternCategory::SqlInjection,
        PatternCategory::Xss,
        PatternCategory::PathTraversal,
        PatternCategory::CommandInjection,
        PatternCategory::LdapInjection,
        PatternCategory::XmlInjection,
    ];
}

impl std::fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternCategory::SqlInjection => write!(f, "sql_injection"),
            PatternCategory::Xss => write!(f, "xss"),
            PatternCategory::PathTraversal => write!(f, "path_traversal"),
            PatternCategory::CommandInjection => write!(f, "command_injection"),
            PatternCategory::LdapInjection => write!(f, "ldap_injection"),
            PatternCategory::XmlInjection => write!(f, "xml_injection"),
        }
    }
}

/// Literal and regex signatures for one category.
struct CategorySignatures {
    category: PatternCategory,
    literals: &'static [&'static str],
    regexes: &'static [&'static str],
}

fn signature_library() -> [CategorySignatures; 6] {
    [
        CategorySignatures {
            category: PatternCategory::SqlInjection,
            literals: &[
                "union select",
                "union all select",
                "or 1=1",
                "' or '",
                "\" or \"",
                "drop table",
                "insert into",
                "delete from",
                "xp_cmdshell",
                "information_schema",
                "waitfor delay",
                "load_file(",
                "benchmark(",
                "pg_sleep(",
            ],
            regexes: &[
                r"'\s*or\s+[\w'\x22]+\s*=\s*[\w'\x22]+",
                r"union(?:\s+all)?\s+select",
                r";\s*(?:drop|alter|truncate|create|rename)\s",
                r"\b(?:and|or)\b\s+\d+\s*=\s*\d+",
                r"/\*.*?\*/\s*(?:union|select|or|and)\b",
                r"\b(?:sleep|benchmark|pg_sleep)\s*\(",
            ],
        },
        CategorySignatures {
            category: PatternCategory::Xss,
            literals: &[
                "<script",
                "</script",
                "javascript:",
                "vbscript:",
                "onerror=",
                "onload=",
                "onmouseover=",
                "document.cookie",
                "document.write",
                "<iframe",
                "srcdoc=",
            ],
            regexes: &[
                r"<\s*script[^>]*>",
                r"\bon\w+\s*=\s*['\x22]?[^'\x22>]*(?:alert|confirm|prompt|eval|document|window)",
                r"data\s*:\s*text/html",
                r"<\s*(?:img|svg|iframe|embed|object|body)[^>]+on\w+\s*=",
                r"\b(?:eval|settimeout|setinterval)\s*\(\s*['\x22]",
            ],
        },
        CategorySignatures {
            category: PatternCategory::PathTraversal,
            literals: &[
                "../",
                "..\\",
                "%2e%2e%2f",
                "%2e%2e/",
                "..%2f",
                "..%5c",
                "%252e%252e",
                "/etc/passwd",
                "/etc/shadow",
                "/proc/self",
                "c:\\windows",
                "php://",
            ],
            regexes: &[
                r"(?:\.\./|\.\.\\){2,}",
                r"/(?:etc/(?:passwd|shadow|hosts|sudoers)|proc/self|windows/system32)",
                r"(?:php|expect|zip|phar)://",
            ],
        },
        CategorySignatures {
            category: PatternCategory::CommandInjection,
            literals: &[
                "/bin/sh",
                "/bin/bash",
                "xterm -display",
                "nc -e",
                "2>&1",
            ],
            regexes: &[
                r"[;|&]\s*(?:cat|ls|id|whoami|uname|pwd|wget|curl|nc|bash|sh|python|perl|ruby|php)\b",
                r"\$\([^)]*\)",
                r"`[^`]+`",
                r"\|\s*(?:nc|netcat|telnet)\b",
                r"\b(?:system|exec|passthru|shell_exec|popen|proc_open)\s*\(",
            ],
        },
        CategorySignatures {
            category: PatternCategory::LdapInjection,
            literals: &["*)(", ")(|", ")(&", "(objectclass=", "*)(uid="],
            regexes: &[r"\)\s*\(\s*[|&!]", r"\*\)\s*\(", r"\(\s*\|\s*\(\s*\w+=\*"],
        },
        CategorySignatures {
            category: PatternCategory::XmlInjection,
            literals: &["<!doctype", "<!entity", "<![cdata[", "xmlns:xi"],
            regexes: &[
                r"<!(?:doctype|entity)[^>]*\b(?:system|public)\b",
                r"<!entity\s+%",
            ],
        },
    ]
}

/// Compiled signature library shared by the guard and the detector.
pub struct PatternLibrary {
    automaton: AhoCorasick,
    literal_categories: Vec<PatternCategory>,
    regexes: Vec<(PatternCategory, Regex)>,
}

impl PatternLibrary {
    pub fn new() -> Result<Self> {
        let mut literals: Vec<String> = Vec::new();
        let mut literal_categories = Vec::new();
        let mut regexes = Vec::new();

        for sig in signature_library() {
            for lit in sig.literals {
                literals.push(lit.to_lowercase());
                literal_categories.push(sig.category);
            }
            for re in sig.regexes {
                let compiled = Regex::new(&format!("(?i){re}"))
                    .map_err(|e| WardenError::Pattern(format!("{}: {e}", sig.category)))?;
                regexes.push((sig.category, compiled));
            }
        }

        let automaton = AhoCorasickBuilder::new()
            .match_kind(MatchKind::LeftmostFirst)
            .build(&literals)
            .map_err(|e| WardenError::Pattern(e.to_string()))?;

        Ok(Self {
            automaton,
            literal_categories,
            regexes,
        })
    }

    /// Pure predicate: does `data` contain any signature of `category`?
    pub fn matches(&self, data: &str, category: PatternCategory) -> bool {
        let lowered = data.to_lowercase();
        for mat in self.automaton.find_iter(&lowered) {
            if self.literal_categories[mat.pattern().as_usize()] == category {
                return true;
            }
        }
        self.regexes
            .iter()
            .filter(|(cat, _)| *cat == category)
            .any(|(_, re)| re.is_match(data))
    }

    /// Match against structured input. Non-string values are canonically
    /// JSON-serialized before matching; anything that cannot be serialized
    /// is treated as a non-match (the blocking layer, not this predicate,
    /// is responsible for failing closed).
    pub fn matches_value(&self, data: &serde_json::Value, category: PatternCategory) -> bool {
        match data {
            serde_json::Value::String(s) => self.matches(s, category),
            other => match serde_json::to_string(other) {
                Ok(text) => self.matches(&text, category),
                Err(_) => false,
            },
        }
    }

    /// All categories matching `data`, in declaration order.
    pub fn matching_categories(&self, data: &str) -> Vec<PatternCategory> {
        PatternCategory::ALL
            .iter()
            .copied()
            .filter(|cat| self.matches(data, *cat))
            .collect()
    }

    pub fn literal_count(&self) -> usize {
        self.literal_categories.len()
    }

    pub fn regex_count(&self) -> usize {
        self.regexes.len()
    }
}

/// Percent-decode `input` twice and strip null bytes, so signatures written
/// in plain form also catch single- and double-encoded payloads.
pub fn decode_layers(input: &str) -> String {
    let once = percent_decode(input);
    let twice = percent_decode(&once);
    twice.replace('\0', "")
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) =
                u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16)
            {
                out.push(hex as char);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> PatternLibrary {
        PatternLibrary::new().unwrap()
    }

    #[test]
    fn detects_sql_injection_signatures() {
        let lib = library();
        let payloads = [
            "' OR 1=1 --",
            "1 UNION SELECT username, password FROM users",
            "id=5; DROP TABLE orders",
            "name=x' or 'a'='a",
        ];
        for p in payloads {
            assert!(
                lib.matches(p, PatternCategory::SqlInjection),
                "should match: {p}"
            );
        }
    }

    #[test]
    fn detects_xss_signatures() {
        let lib = library();
        assert!(lib.matches("<script>alert(1)</script>", PatternCategory::Xss));
        assert!(lib.matches("<img src=x onerror=alert(1)>", PatternCategory::Xss));
        assert!(lib.matches("javascript:alert(document.cookie)", PatternCategory::Xss));
    }

    #[test]
    fn detects_path_traversal_and_command_injection() {
        let lib = library();
        assert!(lib.matches("/../../../../etc/passwd", PatternCategory::PathTraversal));
        assert!(lib.matches("..%2f..%2fetc%2fpasswd", PatternCategory::PathTraversal));
        assert!(lib.matches("; cat /etc/passwd", PatternCategory::CommandInjection));
        assert!(lib.matches("$(whoami)", PatternCategory::CommandInjection));
    }

    #[test]
    fn detects_ldap_and_xml_signatures() {
        let lib = library();
        assert!(lib.matches("admin*)(uid=*", PatternCategory::LdapInjection));
        assert!(lib.matches(
            "<!DOCTYPE foo [<!ENTITY xxe SYSTEM \"file:///etc/passwd\">]>",
            PatternCategory::XmlInjection
        ));
    }

    #[test]
    fn no_false_positives_on_plain_text() {
        let lib = library();
        let benign = [
            "hello world",
            "ordinary product description 12345",
            "TheQuickBrownFox",
            "user42 ordered 3 blue widgets",
        ];
        for text in benign {
            for cat in PatternCategory::ALL {
                assert!(!lib.matches(text, cat), "false positive {cat} on {text:?}");
            }
        }
    }

    #[test]
    fn structured_input_is_serialized_before_matching() {
        let lib = library();
        let value = serde_json::json!({"q": "1 UNION SELECT secret FROM vault"});
        assert!(lib.matches_value(&value, PatternCategory::SqlInjection));
        let clean = serde_json::json!({"q": "plain text", "n": 7});
        assert!(!lib.matches_value(&clean, PatternCategory::SqlInjection));
    }

    #[test]
    fn decode_layers_unwraps_double_encoding() {
        let decoded = decode_layers("%252e%252e%252fetc%252fpasswd");
        assert!(decoded.contains("../etc/passwd"));
    }

    #[test]
    fn category_matching_is_independent() {
        let lib = library();
        let cats = lib.matching_categories("<script>fetch('/x?q=1 union select 1')</script>");
        assert!(cats.contains(&PatternCategory::Xss));
        assert!(cats.contains(&PatternCategory::SqlInjection));
        assert!(!cats.contains(&PatternCategory::LdapInjection));
    }
}

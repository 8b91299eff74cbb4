// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::TemplateError;
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::LazyLock,
};

static KEYWORD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("keyword regex is valid"));

#[derive(Clone, Debug, Eq, PartialEq)]
enum Segment {
    Literal(String),
    Keyword(String),
}

/// A command template with `{{ keyword }}` placeholders.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompiledTemplate {
    template: String,
    segments: Vec<Segment>,
}

impl CompiledTemplate {
    /// Parses `template`.
    pub fn compile(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = template;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                return Err(TemplateError::Unclosed {
                    template: template.to_owned(),
                    position: offset + start,
                });
            };
            let keyword = rest[start + 2..start + 2 + len].trim();
            if !KEYWORD_REGEX.is_match(keyword) {
                return Err(TemplateError::InvalidKeyword {
                    template: template.to_owned(),
                    keyword: keyword.to_owned(),
                });
            }

            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_owned()));
            }
            segments.push(Segment::Keyword(keyword.to_owned()));

            let end = start + 2 + len + 2;
            offset += end;
            rest = &rest[end..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }

        Ok(Self {
            template: template.to_owned(),
            segments,
        })
    }

    /// Returns the template as written.
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Returns the set of keywords used.
    pub fn keywords(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Keyword(keyword) => Some(keyword.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Returns true if the keywords used are exactly `expected`.
    pub fn uses_exactly(&self, expected: &[&str]) -> bool {
        self.keywords() == expected.iter().copied().collect::<BTreeSet<_>>()
    }

    /// Checks that the keywords used are exactly `expected`.
    pub fn validate(&self, expected: &[&'static str]) -> Result<(), TemplateError> {
        if self.uses_exactly(expected) {
            Ok(())
        } else {
            Err(TemplateError::UnexpectedKeywords {
                template: self.template.clone(),
                expected: expected.to_vec(),
            })
        }
    }

    /// Replaces every placeholder with its value. Placeholders without a value become empty.
    pub fn substitute(&self, values: &BTreeMap<String, String>) -> String {
        let mut out = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => out.push_str(literal),
                Segment::Keyword(keyword) => {
                    out.push_str(values.get(keyword).map_or("", String::as_str));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn compile_and_substitute() {
        let template =
            CompiledTemplate::compile("jest {{testFilePath}} -t {{ testNamePattern }} --ci")
                .unwrap();
        assert_eq!(
            template.keywords().into_iter().collect::<Vec<_>>(),
            vec!["testFilePath", "testNamePattern"]
        );
        assert!(template.uses_exactly(&["testNamePattern", "testFilePath"]));
        assert!(!template.uses_exactly(&["testFilePath"]));

        let substituted = template.substitute(&btreemap! {
            "testFilePath".to_owned() => "a.test.js".to_owned(),
            "testNamePattern".to_owned() => "'^(?:adds)$'".to_owned(),
        });
        assert_eq!(substituted, "jest a.test.js -t '^(?:adds)$' --ci");
    }

    #[test]
    fn repeated_keywords() {
        let template = CompiledTemplate::compile("{{ tests }} and {{ tests }}").unwrap();
        assert!(template.uses_exactly(&["tests"]));
        assert_eq!(
            template.substitute(&btreemap! { "tests".to_owned() => "x".to_owned() }),
            "x and x"
        );
    }

    #[test_case("rspec {{ tests", TemplateError::Unclosed {
        template: "rspec {{ tests".to_owned(),
        position: 6,
    } ; "unclosed")]
    #[test_case("rspec {{ two words }}", TemplateError::InvalidKeyword {
        template: "rspec {{ two words }}".to_owned(),
        keyword: "two words".to_owned(),
    } ; "invalid keyword")]
    #[test_case("rspec {{}}", TemplateError::InvalidKeyword {
        template: "rspec {{}}".to_owned(),
        keyword: String::new(),
    } ; "empty keyword")]
    fn compile_errors(input: &str, expected: TemplateError) {
        assert_eq!(CompiledTemplate::compile(input).unwrap_err(), expected);
    }

    #[test]
    fn validate_reports_expected() {
        let template = CompiledTemplate::compile("rspec").unwrap();
        assert_eq!(
            template.validate(&["tests"]).unwrap_err(),
            TemplateError::UnexpectedKeywords {
                template: "rspec".to_owned(),
                expected: vec!["tests"],
            }
        );
    }
}

// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cache keys derived from a function id and its call arguments.
//!
//! A [`KeyTemplate`] is a string with `{arg}` placeholders, e.g. `"user:{id}"`.
//! It is validated against the function's declared argument names when it is
//! registered, rendered with the [`CallArgs`] of each call, and turned into a glob
//! pattern (`"user:*"`) that matches every key it can render.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;

use crate::errors::CacheError;
use crate::glob::Glob;

/// The named arguments of one call, rendered as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    args: BTreeMap<String, String>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.args.insert(name.into(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Arg(String),
}

/// A validated key template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    template: String,
    parts: Vec<Part>,
    pattern: Glob,
}

impl KeyTemplate {
    /// Parse `template` and check that every placeholder names one of `args`.
    ///
    /// `{{` and `}}` are a literal brace.
    pub fn parse(template: &str, args: &[&str]) -> Result<Self, CacheError> {
        let err = |arg: &str| CacheError::KeyTemplate {
            template: template.to_string(),
            arg: arg.to_string(),
        };

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }

                    let name = name.trim().to_string();
                    if !closed || !args.contains(&name.as_str()) {
                        return Err(err(&name));
                    }

                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Arg(name));
                }
                '}' => return Err(err("}")),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        let pattern = Glob::new(&Self::build_pattern(&parts));
        Ok(Self {
            template: template.to_string(),
            parts,
            pattern,
        })
    }

    /// The default template of a function: `"{prefix}:{func}:{arg}:{{arg}}..."`.
    ///
    /// An empty prefix is omitted.
    pub fn default_for(prefix: &str, func: &str, args: &[&str]) -> Self {
        let mut parts = Vec::with_capacity(args.len() * 2 + 1);

        let mut head = String::new();
        if !prefix.is_empty() {
            head.push_str(prefix);
            head.push(':');
        }
        head.push_str(func);

        let mut template = head.replace('{', "{{").replace('}', "}}");
        let mut literal = head;

        for arg in args {
            literal.push(':');
            literal.push_str(arg);
            literal.push(':');
            parts.push(Part::Literal(std::mem::take(&mut literal)));
            parts.push(Part::Arg(arg.to_string()));

            template.push_str(&format!(":{}:{{{}}}", arg, arg));
        }

        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        let pattern = Glob::new(&Self::build_pattern(&parts));
        Self {
            template,
            parts,
            pattern,
        }
    }

    fn build_pattern(parts: &[Part]) -> String {
        let mut pattern = String::new();
        for part in parts {
            match part {
                Part::Literal(s) => {
                    for c in s.chars() {
                        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                            pattern.push('\\');
                        }
                        pattern.push(c);
                    }
                }
                Part::Arg(_) => {
                    if !pattern.ends_with('*') || pattern.ends_with("\\*") {
                        pattern.push('*');
                    }
                }
            }
        }
        pattern
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Names of the arguments this template reads, in order of appearance.
    pub fn arg_names(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Arg(a) => Some(a.as_str()),
                Part::Literal(_) => None,
            })
            .collect()
    }

    /// Render the key of one call. An argument absent from `args` renders empty.
    pub fn render(&self, args: &CallArgs) -> String {
        let mut key = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => key.push_str(s),
                Part::Arg(name) => key.push_str(args.get(name).unwrap_or_default()),
            }
        }
        key
    }

    /// The glob matching every key this template renders.
    pub fn pattern(&self) -> &Glob {
        &self.pattern
    }

    pub fn matches(&self, key: &str) -> bool {
        self.pattern.matches(key)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.template)
    }
}

/// Maps a function id to the key templates registered for it.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    by_func: Mutex<BTreeMap<String, Vec<KeyTemplate>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, func: &str, template: KeyTemplate) {
        let mut by_func = self.by_func.lock();
        let templates = by_func.entry(func.to_string()).or_default();
        if !templates.contains(&template) {
            templates.push(template);
        }
    }

    pub fn templates(&self, func: &str) -> Vec<KeyTemplate> {
        self.by_func.lock().get(func).cloned().unwrap_or_default()
    }

    /// Find the function and the template that may have rendered `key`.
    pub fn find(&self, key: &str) -> Option<(String, KeyTemplate)> {
        let by_func = self.by_func.lock();
        for (func, templates) in by_func.iter() {
            for template in templates {
                if template.matches(key) {
                    return Some((func.clone(), template.clone()));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_render() -> anyhow::Result<()> {
        let t = KeyTemplate::parse("{arg1}:{kwarg1}-{kwarg3}", &["arg1", "kwarg1", "kwarg3"])?;
        let args = CallArgs::new()
            .arg("arg1", "A1")
            .arg("kwarg1", "k1")
            .arg("kwarg3", true);
        assert_eq!(t.render(&args), "A1:k1-true");

        let args = CallArgs::new().arg("arg1", "a1");
        assert_eq!(t.render(&args), "a1:-");
        Ok(())
    }

    #[test]
    fn test_unknown_arg_fails_at_parse() {
        let err = KeyTemplate::parse("key:{wrong_key}:{a}", &["a"]).unwrap_err();
        match err {
            CacheError::KeyTemplate { template, arg } => {
                assert_eq!(template, "key:{wrong_key}:{a}");
                assert_eq!(arg, "wrong_key");
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(KeyTemplate::parse("key:{a", &["a"]).is_err());
        assert!(KeyTemplate::parse("key:a}", &["a"]).is_err());
    }

    #[test]
    fn test_braces_escape() -> anyhow::Result<()> {
        let t = KeyTemplate::parse("{{x}}:{a}", &["a"])?;
        assert_eq!(t.render(&CallArgs::new().arg("a", 1)), "{x}:1");
        Ok(())
    }

    #[test]
    fn test_default_template() {
        let t = KeyTemplate::default_for("fail", "get_user", &["id", "full"]);
        assert_eq!(t.as_str(), "fail:get_user:id:{id}:full:{full}");
        assert_eq!(t.arg_names(), vec!["id", "full"]);

        let args = CallArgs::new().arg("id", 7).arg("full", false);
        assert_eq!(t.render(&args), "fail:get_user:id:7:full:false");

        let t = KeyTemplate::default_for("", "ping", &[]);
        assert_eq!(t.as_str(), "ping");
        assert_eq!(t.render(&CallArgs::new()), "ping");
    }

    #[test]
    fn test_pattern() -> anyhow::Result<()> {
        let t = KeyTemplate::parse("func2:{k}:user:{user}", &["k", "user"])?;
        assert_eq!(t.pattern().as_str(), "func2:*:user:*");
        assert!(t.matches("func2:-:user:1"));
        assert!(!t.matches("func2:user:1"));

        let t = KeyTemplate::parse("a{x}{y}", &["x", "y"])?;
        assert_eq!(t.pattern().as_str(), "a*");

        let t = KeyTemplate::parse("a*{x}", &["x"])?;
        assert_eq!(t.pattern().as_str(), r"a\**");
        assert!(t.matches("a*1"));
        assert!(!t.matches("ab1"));
        Ok(())
    }

    #[test]
    fn test_registry_find() -> anyhow::Result<()> {
        let reg = TemplateRegistry::new();
        reg.register("func1", KeyTemplate::parse("func1:{a}", &["a"])?);
        reg.register("func2", KeyTemplate::parse("func2:{k}:user:{user}", &["k", "user"])?);
        reg.register("func1", KeyTemplate::parse("func1:{a}", &["a"])?);

        assert_eq!(reg.templates("func1").len(), 1);

        let (func, t) = reg.find("func1:test").unwrap();
        assert_eq!(func, "func1");
        assert_eq!(t.as_str(), "func1:{a}");

        assert_eq!(reg.find("func2:-:user:1").unwrap().0, "func2");
        assert!(reg.find("func:1").is_none());
        Ok(())
    }
}

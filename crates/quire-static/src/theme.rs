//! Theme variables substituted into hand-written CSS.
//!
//! Snippets reference generated values as `$kebab-case-name`. Numbers become
//! pixel lengths unless the variable is known to be unitless.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;

/// Variables that are plain numbers rather than pixel lengths.
pub const UNITLESS_VARIABLES: [&str; 6] = [
    "normalWeight",
    "semiBoldWeight",
    "boldWeight",
    "fontScaleFactor",
    "dropcapLineHeight",
    "zIndexFloating",
];

/// A generated variable value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Number(f64),
    Text(String),
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        VariableValue::Number(value)
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Text(value.to_string())
    }
}

/// Errors from variable substitution.
#[derive(Debug, thiserror::Error)]
pub enum ThemeError {
    #[error("Unknown theme variable ${0}")]
    UnknownVariable(String),
}

/// Named values available to CSS snippets, keyed by camelCase name.
#[derive(Debug, Clone, PartialEq)]
pub struct ThemeVariables {
    values: BTreeMap<String, VariableValue>,
    unitless: BTreeSet<String>,
}

impl ThemeVariables {
    /// Variables with no values and the default unitless list.
    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
            unitless: UNITLESS_VARIABLES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<VariableValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Treat `name` as a plain number.
    pub fn mark_unitless(&mut self, name: impl Into<String>) {
        self.unitless.insert(name.into());
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = (String, VariableValue)>) {
        self.values.extend(values);
    }

    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.values.get(name)
    }

    /// CSS text for a variable.
    pub fn css_value(&self, name: &str) -> Option<String> {
        let value = self.values.get(name)?;
        Some(match value {
            VariableValue::Text(text) => text.clone(),
            VariableValue::Number(number) => {
                let number = format_number(*number);
                if self.is_unitless(name) {
                    number
                } else {
                    format!("{}px", number)
                }
            }
        })
    }

    fn is_unitless(&self, name: &str) -> bool {
        self.unitless.contains(name) || self.unitless.contains(&kebab_case(name))
    }

    /// Replace every `$name` placeholder in `template`.
    pub fn render(&self, template: &str) -> Result<String, ThemeError> {
        static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"\$([a-z][a-z0-9]*(?:-[a-z0-9]+)*)").expect("Invalid placeholder regex")
        });

        let by_kebab: BTreeMap<String, &str> = self
            .values
            .keys()
            .map(|name| (kebab_case(name), name.as_str()))
            .collect();

        let mut missing = None;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
            let placeholder = &caps[1];
            match by_kebab
                .get(placeholder)
                .and_then(|name| self.css_value(name))
            {
                Some(value) => value,
                None => {
                    missing.get_or_insert_with(|| placeholder.to_string());
                    caps[0].to_string()
                }
            }
        });

        match missing {
            Some(name) => Err(ThemeError::UnknownVariable(name)),
            None => Ok(rendered.into_owned()),
        }
    }
}

impl Default for ThemeVariables {
    fn default() -> Self {
        let mut vars = Self::empty();

        vars.set("pageWidth", 720.0);
        vars.set("baseMargin", 8.0);
        vars.set("normalWeight", 400.0);
        vars.set("dropcapFontSize", "3.95rem");
        vars.set("dropcapLineHeight", 0.85);
        vars.set("dropcapGap", 6.0);

        vars.set("lightBackground", "#fcfcff");
        vars.set("lightForeground", "#2b2b2b");
        vars.set("lightLink", "#1f5fbf");
        vars.set("lightLinkVisited", "#6a3fb5");
        vars.set("lightDropcap", "#8d8d8d");

        vars.set("darkBackground", "#1f2023");
        vars.set("darkForeground", "#e2e2e2");
        vars.set("darkLink", "#7fb1ff");
        vars.set("darkLinkVisited", "#b79cf0");
        vars.set("darkDropcap", "#a3a3a3");

        vars
    }
}

/// Hand-written theme CSS appended to the extracted critical CSS.
pub const THEME_TEMPLATE: &str = r#"
:root {
  --page-width: $page-width;
  --base-margin: $base-margin;
}

:root[data-theme="light"] {
  --background: $light-background;
  --foreground: $light-foreground;
  --link: $light-link;
  --link-visited: $light-link-visited;
  --dropcap: $light-dropcap;
}

:root[data-theme="dark"] {
  --background: $dark-background;
  --foreground: $dark-foreground;
  --link: $dark-link;
  --link-visited: $dark-link-visited;
  --dropcap: $dark-dropcap;
}

html {
  background-color: var(--background);
  color: var(--foreground);
}

a {
  color: var(--link);
}

a:visited {
  color: var(--link-visited);
}

p.dropcap::first-letter {
  float: left;
  font-size: $dropcap-font-size;
  line-height: $dropcap-line-height;
  font-weight: $normal-weight;
  margin-right: $dropcap-gap;
  color: var(--dropcap);
}
"#;

/// `pageWidth` -> `page-width`.
pub fn kebab_case(name: &str) -> String {
    static BOUNDARY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"([a-z0-9])([A-Z])").expect("Invalid boundary regex"));

    BOUNDARY.replace_all(name, "$1-$2").to_lowercase()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

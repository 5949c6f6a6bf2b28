use std::collections::HashMap;
use std::fmt::Display;
use std::sync::OnceLock;

use clap::ValueEnum;
use include_dir::{include_dir, Dir};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::session::Response;

static LANG_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/src/lang");

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    ValueEnum,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    He,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::He => "he",
        }
    }

    pub fn toggle(self) -> Self {
        match self {
            Language::En => Language::He,
            Language::He => Language::En,
        }
    }

    pub fn is_rtl(self) -> bool {
        self == Language::He
    }

    pub fn texts(self) -> &'static Texts {
        static EN: OnceLock<Texts> = OnceLock::new();
        static HE: OnceLock<Texts> = OnceLock::new();
        match self {
            Language::En => EN.get_or_init(|| Texts::load(Language::En, None)),
            Language::He => HE.get_or_init(|| Texts::load(Language::He, Some(Language::En.texts()))),
        }
    }
}

#[derive(Deserialize, Debug)]
struct Dictionary {
    name: String,
    texts: HashMap<String, String>,
}

/// UI strings of one language, falling back to English for missing keys
#[derive(Debug)]
pub struct Texts {
    language: Language,
    entries: HashMap<String, String>,
    fallback: Option<&'static Texts>,
}

impl Texts {
    fn load(language: Language, fallback: Option<&'static Texts>) -> Self {
        let file_name = format!("{}.json", language.code());
        let entries = LANG_DIR
            .get_file(&file_name)
            .and_then(|file| file.contents_utf8())
            .and_then(|text| match serde_json::from_str::<Dictionary>(text) {
                Ok(dict) if dict.name == language.code() => Some(dict.texts),
                Ok(dict) => {
                    warn!(file = %file_name, name = %dict.name, "dictionary name mismatch");
                    Some(dict.texts)
                }
                Err(err) => {
                    warn!(file = %file_name, %err, "unreadable dictionary");
                    None
                }
            })
            .unwrap_or_default();

        Self {
            language,
            entries,
            fallback,
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Text for `key`; an unknown key renders as itself.
    pub fn get<'a>(&'a self, key: &'a str) -> &'a str {
        self.entries
            .get(key)
            .map(String::as_str)
            .or_else(|| self.fallback.and_then(|f| f.entries.get(key).map(String::as_str)))
            .unwrap_or(key)
    }

    /// Text for `key` with `{0}`, `{1}`, ... replaced by `args`.
    pub fn format(&self, key: &str, args: &[&dyn Display]) -> String {
        args.iter()
            .enumerate()
            .fold(self.get(key).to_string(), |text, (i, arg)| {
                text.replace(&format!("{{{i}}}"), &arg.to_string())
            })
    }
}

/// Response bound to a key press. Hebrew layouts put `ל` on K and `ג` on D.
pub fn response_for_key(c: char) -> Option<Response> {
    match c {
        'k' | 'K' | 'ל' => Some(Response::Change),
        'd' | 'D' | 'ג' => Some(Response::NoChange),
        _ => None,
    }
}

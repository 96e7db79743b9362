use super::ConfigErrors;
use std::{fs, path::Path};

/// Keywords that open a block when they stand alone on a line.
pub const BLOCK_KEYWORDS: [&str; 4] = ["general", "setup", "dynamic", "bar"];

/// One block of the configuration file: the keyword that opened it plus every
/// `key value...` line up to the next block keyword, in file order.
#[derive(Debug, Clone)]
pub struct Block {
    pub keyword: &'static str,
    entries: Vec<(String, Vec<String>)>,
}

impl Block {
    /// First entry for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, values)| values.as_slice())
    }

    /// Every entry for `key`, for repeatable keys.
    pub fn get_all(&self, key: &str) -> Vec<&[String]> {
        self.entries
            .iter()
            .filter(|(name, _)| name == key)
            .map(|(_, values)| values.as_slice())
            .collect()
    }

    /// First value of `key`, or a typed missing-key error.
    pub fn one(&self, key: &'static str) -> Result<&str, ConfigErrors> {
        self.get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
            .ok_or(ConfigErrors::MissingKey {
                block: self.keyword,
                key,
            })
    }

    /// All values of `key` as one list, or a typed missing-key error.
    pub fn list(&self, key: &'static str) -> Result<&[String], ConfigErrors> {
        self.get(key).ok_or(ConfigErrors::MissingKey {
            block: self.keyword,
            key,
        })
    }
}

/// Strip a `#` comment, leaving the line up to the comment character.
pub fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(at) => &line[..at],
        None => line,
    }
}

pub fn read_blocks(path: &Path) -> Result<Vec<Block>, ConfigErrors> {
    let text = fs::read_to_string(path).map_err(|source| ConfigErrors::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse_blocks(&text, path)
}

pub(crate) fn parse_blocks(text: &str, path: &Path) -> Result<Vec<Block>, ConfigErrors> {
    let mut blocks: Vec<Block> = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        // a block keyword standing alone opens a new block
        if let Some(keyword) = BLOCK_KEYWORDS.iter().copied().find(|keyword| *keyword == line) {
            blocks.push(Block {
                keyword,
                entries: Vec::new(),
            });
            continue;
        }

        let mut tokens = line.split_whitespace().map(str::to_owned);
        let key = tokens.next().expect("non-empty line has a first token");
        let values: Vec<String> = tokens.collect();

        match blocks.last_mut() {
            Some(block) => block.entries.push((key, values)),
            None => {
                return Err(ConfigErrors::LineOutsideBlock {
                    path: path.to_path_buf(),
                    line: index + 1,
                })
            }
        }
    }

    Ok(blocks)
}

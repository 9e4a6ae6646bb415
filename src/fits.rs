//! Primary-header card editing for FITS files.
//!
//! Only the header unit is interpreted. Everything after the header blocks
//! is carried through untouched, so the image data stays byte-for-byte
//! identical when the header grows by a block.

use crate::error::CcdError;
use std::fs;
use std::path::{Path, PathBuf};

pub const CARD_LEN: usize = 80;
pub const BLOCK_LEN: usize = 2880;
const CARDS_PER_BLOCK: usize = BLOCK_LEN / CARD_LEN;
const KEY_LEN: usize = 8;
/// Fixed-format values end at column 30
const VALUE_WIDTH: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Str(String),
    Int(i64),
    Float(f64),
    Logical(bool),
}

impl From<&str> for CardValue {
    fn from(value: &str) -> Self {
        CardValue::Str(value.to_string())
    }
}

impl From<String> for CardValue {
    fn from(value: String) -> Self {
        CardValue::Str(value)
    }
}

impl From<i64> for CardValue {
    fn from(value: i64) -> Self {
        CardValue::Int(value)
    }
}

impl From<u32> for CardValue {
    fn from(value: u32) -> Self {
        CardValue::Int(value as i64)
    }
}

impl From<f64> for CardValue {
    fn from(value: f64) -> Self {
        CardValue::Float(value)
    }
}

impl From<bool> for CardValue {
    fn from(value: bool) -> Self {
        CardValue::Logical(value)
    }
}

impl CardValue {
    fn render(&self) -> String {
        match self {
            CardValue::Str(s) => {
                let escaped = s.replace('\'', "''");
                format!("'{:<8}'", escaped)
            }
            CardValue::Int(i) => format!("{:>width$}", i, width = VALUE_WIDTH),
            CardValue::Float(f) => format!("{:>width$}", render_float(*f), width = VALUE_WIDTH),
            CardValue::Logical(b) => {
                format!("{:>width$}", if *b { "T" } else { "F" }, width = VALUE_WIDTH)
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CardValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CardValue::Float(f) => Some(*f),
            CardValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

fn render_float(value: f64) -> String {
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e15).contains(&magnitude) {
        format!("{:E}", value)
    } else if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// One `KEY = value / comment` card
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCard {
    pub key: String,
    pub value: CardValue,
    pub comment: String,
}

impl HeaderCard {
    pub fn new(key: &str, value: impl Into<CardValue>, comment: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
            comment: comment.to_string(),
        }
    }

    /// Render to exactly 80 ASCII characters
    pub fn render(&self) -> Result<String, CcdError> {
        validate_key(&self.key)?;
        let value = self.value.render();
        if !value.is_ascii() || !self.comment.is_ascii() {
            return Err(CcdError::HeaderWriteFailed(format!(
                "card {} contains non-ASCII text",
                self.key
            )));
        }

        let mut card = format!("{:<width$}= {}", self.key, value, width = KEY_LEN);
        if card.len() > CARD_LEN {
            return Err(CcdError::HeaderWriteFailed(format!(
                "value for {} does not fit in one card",
                self.key
            )));
        }
        if !self.comment.is_empty() {
            card.push_str(" / ");
            card.push_str(&self.comment);
        }
        card.truncate(CARD_LEN);
        Ok(format!("{:<width$}", card, width = CARD_LEN))
    }

    /// Parse a value card; commentary and structural cards yield `None`
    pub fn parse(card: &str) -> Option<HeaderCard> {
        if !card.is_ascii() || card.get(KEY_LEN..KEY_LEN + 2) != Some("= ") {
            return None;
        }
        let key = card[..KEY_LEN].trim_end().to_string();
        let rest = card[KEY_LEN + 2..].trim_start();

        let (value, after) = if let Some(body) = rest.strip_prefix('\'') {
            let mut text = String::new();
            let mut chars = body.char_indices().peekable();
            let mut end = body.len();
            while let Some((i, c)) = chars.next() {
                if c == '\'' {
                    if matches!(chars.peek(), Some((_, '\''))) {
                        text.push('\'');
                        chars.next();
                    } else {
                        end = i + 1;
                        break;
                    }
                } else {
                    text.push(c);
                }
            }
            (CardValue::Str(text.trim_end().to_string()), &body[end..])
        } else {
            let (raw, after) = match rest.find('/') {
                Some(slash) => (&rest[..slash], &rest[slash..]),
                None => (rest, ""),
            };
            let raw = raw.trim();
            let value = match raw {
                "T" => CardValue::Logical(true),
                "F" => CardValue::Logical(false),
                _ => match raw.parse::<i64>() {
                    Ok(i) => CardValue::Int(i),
                    Err(_) => CardValue::Float(raw.replace('D', "E").parse().ok()?),
                },
            };
            (value, after)
        };

        let comment = after
            .trim_start()
            .strip_prefix('/')
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        Some(HeaderCard {
            key,
            value,
            comment,
        })
    }
}

fn validate_key(key: &str) -> Result<(), CcdError> {
    let valid = !key.is_empty()
        && key.len() <= KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CcdError::HeaderWriteFailed(format!(
            "invalid FITS keyword '{}'",
            key
        )))
    }
}

fn card_key(card: &str) -> &str {
    card.get(..KEY_LEN).unwrap_or(card).trim_end()
}

/// Header cards of the primary HDU plus the untouched remainder of the file
#[derive(Debug, Clone)]
pub struct FitsHeader {
    cards: Vec<String>,
    remainder: Vec<u8>,
}

impl FitsHeader {
    /// Header of a data-less primary HDU
    pub fn empty_primary() -> Self {
        let cards = [
            HeaderCard::new("SIMPLE", true, "conforms to FITS standard"),
            HeaderCard::new("BITPIX", 16_i64, "array data type"),
            HeaderCard::new("NAXIS", 0_i64, "number of array dimensions"),
        ]
        .iter()
        .filter_map(|c| c.render().ok())
        .collect();
        Self {
            cards,
            remainder: Vec::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CcdError> {
        if bytes.len() < BLOCK_LEN || !bytes.starts_with(b"SIMPLE  =") {
            return Err(CcdError::HeaderWriteFailed(
                "not a FITS file (missing SIMPLE card)".to_string(),
            ));
        }

        let mut cards = Vec::new();
        for (index, raw) in bytes.chunks_exact(CARD_LEN).enumerate() {
            let card = std::str::from_utf8(raw).map_err(|_| {
                CcdError::HeaderWriteFailed(format!("non-ASCII header card at {}", index))
            })?;
            if card_key(card) == "END" {
                let header_len = (index / CARDS_PER_BLOCK + 1) * BLOCK_LEN;
                let remainder = bytes.get(header_len..).unwrap_or_default().to_vec();
                return Ok(Self { cards, remainder });
            }
            cards.push(card.to_string());
        }

        Err(CcdError::HeaderWriteFailed(
            "FITS header has no END card".to_string(),
        ))
    }

    pub fn read(path: &Path) -> Result<Self, CcdError> {
        let bytes = fs::read(path).map_err(|e| {
            CcdError::HeaderWriteFailed(format!("could not open {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn get(&self, key: &str) -> Option<HeaderCard> {
        self.cards
            .iter()
            .filter(|card| card_key(card) == key)
            .find_map(|card| HeaderCard::parse(card))
    }

    /// Replace the card with the same key, or append a new one
    pub fn set(&mut self, card: &HeaderCard) -> Result<(), CcdError> {
        let rendered = card.render()?;
        match self.cards.iter_mut().find(|c| card_key(c) == card.key) {
            Some(existing) => *existing = rendered,
            None => self.cards.push(rendered),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.cards.len() / CARDS_PER_BLOCK + 1) * BLOCK_LEN);
        for card in &self.cards {
            out.extend_from_slice(card.as_bytes());
        }
        out.extend_from_slice(format!("{:<width$}", "END", width = CARD_LEN).as_bytes());
        let padded = out.len().div_ceil(BLOCK_LEN) * BLOCK_LEN;
        out.resize(padded, b' ');
        out.extend_from_slice(&self.remainder);
        out
    }

    /// Write through a sibling temp file so a crash never leaves half a header
    pub fn write(&self, path: &Path) -> Result<(), CcdError> {
        let mut tmp = PathBuf::from(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tmp.set_file_name(format!(".{}.hdr", name));

        fs::write(&tmp, self.to_bytes()).map_err(|e| {
            CcdError::HeaderWriteFailed(format!("could not write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CcdError::HeaderWriteFailed(format!("could not replace {}: {}", path.display(), e))
        })
    }
}

/// Open an existing image, write every card, close
pub fn update_header(path: &Path, cards: &[HeaderCard]) -> Result<(), CcdError> {
    let mut header = FitsHeader::read(path)?;
    for card in cards {
        header.set(card)?;
    }
    header.write(path)
}

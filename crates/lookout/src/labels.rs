//! Class label maps.
//!
//! Detection models report numeric class ids. A [`LabelMap`] translates them to human-readable
//! names. It is loaded once at startup from a text-format protobuf file and then shared read-only
//! (behind an [`Arc`][std::sync::Arc]) by every detector instance.
//!
//! The file format consists of `item` blocks:
//!
//! ```text
//! item {
//!   name: "/m/01g317"
//!   id: 1
//!   display_name: "person"
//! }
//! ```

use std::{collections::HashMap, fs, path::Path};

use anyhow::{anyhow, bail, Context};

use crate::image::Color;

/// Label used for class ids that are not in the label map.
pub const UNKNOWN_LABEL: &str = "N/A";

/// Box colors, indexed by class id.
const PALETTE: [Color; 20] = [
    Color::from_rgb8(240, 248, 255), // AliceBlue
    Color::from_rgb8(127, 255, 0),   // Chartreuse
    Color::from_rgb8(0, 255, 255),   // Aqua
    Color::from_rgb8(127, 255, 212), // Aquamarine
    Color::from_rgb8(240, 255, 255), // Azure
    Color::from_rgb8(245, 245, 220), // Beige
    Color::from_rgb8(255, 228, 196), // Bisque
    Color::from_rgb8(255, 235, 205), // BlanchedAlmond
    Color::from_rgb8(138, 43, 226),  // BlueViolet
    Color::from_rgb8(222, 184, 135), // BurlyWood
    Color::from_rgb8(95, 158, 160),  // CadetBlue
    Color::from_rgb8(250, 235, 215), // AntiqueWhite
    Color::from_rgb8(210, 105, 30),  // Chocolate
    Color::from_rgb8(255, 127, 80),  // Coral
    Color::from_rgb8(100, 149, 237), // CornflowerBlue
    Color::from_rgb8(255, 248, 220), // Cornsilk
    Color::from_rgb8(220, 20, 60),   // Crimson
    Color::from_rgb8(0, 255, 255),   // Cyan
    Color::from_rgb8(0, 139, 139),   // DarkCyan
    Color::from_rgb8(184, 134, 11),  // DarkGoldenRod
];

/// Returns the color boxes of class `class_id` are drawn in.
pub fn class_color(class_id: u32) -> Color {
    PALETTE[class_id as usize % PALETTE.len()]
}

/// Formats the text shown next to a detection, eg. `person: 87%`.
///
/// The percentage is truncated, not rounded.
pub fn format_label(name: &str, confidence: f32) -> String {
    format!("{}: {}%", name, (confidence * 100.0) as u32)
}

/// A mapping from class ids to names.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    names: HashMap<u32, String>,
}

impl LabelMap {
    /// Loads a label map from a `.pbtxt` file, ignoring classes with an id above `max_classes`.
    pub fn load<P: AsRef<Path>>(path: P, max_classes: u32) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read label map '{}'", path.display()))?;
        let map = Self::parse(&text, max_classes)
            .with_context(|| format!("failed to parse label map '{}'", path.display()))?;
        log::debug!("loaded {} labels from '{}'", map.len(), path.display());
        Ok(map)
    }

    /// Parses the text format of a label map.
    ///
    /// Items with a `display_name` use it; otherwise their `name` is used.
    pub fn parse(text: &str, max_classes: u32) -> anyhow::Result<Self> {
        let mut names = HashMap::new();
        let mut tokens = Tokenizer::new(text);

        while let Some(token) = tokens.next()? {
            match token {
                Token::Word(word) if word == "item" => {}
                other => bail!(
                    "line {}: expected `item`, found {}",
                    tokens.line,
                    other.describe()
                ),
            }
            tokens.skip_colon()?;
            tokens.expect_open()?;

            let item = parse_item(&mut tokens)?;
            let id = item
                .id
                .ok_or_else(|| anyhow!("line {}: item without `id`", tokens.line))?;
            if id < 1 {
                bail!("line {}: label ids must be >= 1 (got {id})", tokens.line);
            }
            let id = id as u32;
            if id > max_classes {
                log::debug!("ignoring label {id}: outside of the {max_classes} model classes");
                continue;
            }
            let Some(name) = item.display_name.or(item.name) else {
                bail!("line {}: item {id} has no name", tokens.line);
            };
            if let Some(old) = names.insert(id, name) {
                log::warn!("label {id} is defined more than once, replacing '{old}'");
            }
        }

        Ok(Self { names })
    }

    /// Builds a label map from `(id, name)` pairs.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(|(id, n)| (id, n.into())).collect(),
        }
    }

    /// Returns the name of class `id`, if it is known.
    pub fn get(&self, id: u32) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Returns the name of class `id`, or [`UNKNOWN_LABEL`].
    pub fn name_or_unknown(&self, id: u32) -> &str {
        self.get(id).unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Default)]
struct Item {
    id: Option<i64>,
    name: Option<String>,
    display_name: Option<String>,
}

fn parse_item(tokens: &mut Tokenizer<'_>) -> anyhow::Result<Item> {
    let mut item = Item::default();
    loop {
        let key = match tokens.next()? {
            Some(Token::Close) => return Ok(item),
            Some(Token::Word(key)) => key,
            Some(other) => bail!(
                "line {}: expected field name, found {}",
                tokens.line,
                other.describe()
            ),
            None => bail!("unexpected end of input inside `item`"),
        };
        tokens.skip_colon()?;

        let value = match tokens.next()? {
            Some(Token::Open) => {
                // Nested messages (eg. `keypoints`) are not needed.
                tokens.skip_block()?;
                continue;
            }
            Some(Token::Word(value) | Token::Str(value)) => value,
            Some(other) => bail!(
                "line {}: expected value for `{key}`, found {}",
                tokens.line,
                other.describe()
            ),
            None => bail!("unexpected end of input after `{key}`"),
        };

        match key.as_str() {
            "id" => {
                let id = value
                    .parse()
                    .with_context(|| format!("line {}: invalid id '{value}'", tokens.line))?;
                item.id = Some(id);
            }
            "name" => item.name = Some(value),
            "display_name" => item.display_name = Some(value),
            _ => log::trace!("skipping label map field `{key}`"),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Colon,
    Open,
    Close,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(w) => format!("`{w}`"),
            Token::Str(s) => format!("\"{s}\""),
            Token::Colon => "`:`".into(),
            Token::Open => "`{`".into(),
            Token::Close => "`}`".into(),
        }
    }
}

struct Tokenizer<'a> {
    rest: &'a str,
    line: usize,
    peeked: Option<Token>,
}

impl<'a> Tokenizer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            rest: text,
            line: 1,
            peeked: None,
        }
    }

    fn next(&mut self) -> anyhow::Result<Option<Token>> {
        if let Some(token) = self.peeked.take() {
            return Ok(Some(token));
        }

        loop {
            let Some(c) = self.rest.chars().next() else {
                return Ok(None);
            };
            match c {
                '\n' => {
                    self.line += 1;
                    self.rest = &self.rest[1..];
                }
                c if c.is_whitespace() => self.rest = &self.rest[c.len_utf8()..],
                '#' => {
                    let end = self.rest.find('\n').unwrap_or(self.rest.len());
                    self.rest = &self.rest[end..];
                }
                _ => break,
            }
        }

        let mut chars = self.rest.chars();
        let token = match chars.next() {
            Some(':') => {
                self.rest = &self.rest[1..];
                Token::Colon
            }
            Some('{') => {
                self.rest = &self.rest[1..];
                Token::Open
            }
            Some('}') => {
                self.rest = &self.rest[1..];
                Token::Close
            }
            Some(quote @ ('"' | '\'')) => {
                let body = &self.rest[1..];
                let Some(end) = body.find(quote) else {
                    bail!("line {}: unterminated string", self.line);
                };
                let value = body[..end].to_string();
                self.line += value.matches('\n').count();
                self.rest = &body[end + 1..];
                Token::Str(value)
            }
            Some(_) => {
                let end = self
                    .rest
                    .find(|c: char| c.is_whitespace() || matches!(c, ':' | '{' | '}' | '#'))
                    .unwrap_or(self.rest.len());
                let word = self.rest[..end].to_string();
                self.rest = &self.rest[end..];
                Token::Word(word)
            }
            None => return Ok(None),
        };
        Ok(Some(token))
    }

    /// Consumes an optional `:`.
    fn skip_colon(&mut self) -> anyhow::Result<()> {
        match self.next()? {
            Some(Token::Colon) | None => {}
            Some(other) => self.peeked = Some(other),
        }
        Ok(())
    }

    fn expect_open(&mut self) -> anyhow::Result<()> {
        match self.next()? {
            Some(Token::Open) => Ok(()),
            Some(other) => bail!("line {}: expected `{{`, found {}", self.line, other.describe()),
            None => bail!("unexpected end of input, expected `{{`"),
        }
    }

    /// Skips the rest of a block whose `{` was already consumed.
    fn skip_block(&mut self) -> anyhow::Result<()> {
        let mut depth = 1;
        while depth > 0 {
            match self.next()? {
                Some(Token::Open) => depth += 1,
                Some(Token::Close) => depth -= 1,
                Some(_) => {}
                None => bail!("unexpected end of input inside nested block"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COCO_EXCERPT: &str = r#"
# COCO label map excerpt
item {
  name: "/m/01g317"
  id: 1
  display_name: "person"
}
item {
  name: "/m/0199g"
  id: 2
  display_name: "bicycle"
}
item {
  name: "toothbrush"
  id: 90
}
item {
  name: "/m/unused"
  id: 91
  display_name: "out of range"
}
"#;

    #[test]
    fn parses_items() {
        let map = LabelMap::parse(COCO_EXCERPT, 90).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(1), Some("person"));
        assert_eq!(map.get(2), Some("bicycle"));
        // Falls back to `name` without `display_name`.
        assert_eq!(map.get(90), Some("toothbrush"));
        // Dropped, above `max_classes`.
        assert_eq!(map.get(91), None);
        assert_eq!(map.name_or_unknown(91), UNKNOWN_LABEL);
    }

    #[test]
    fn max_classes_limits_ids() {
        let map = LabelMap::parse(COCO_EXCERPT, 1).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(2), None);
    }

    #[test]
    fn compact_and_nested_syntax() {
        let map = LabelMap::parse(
            "item { id: 3 display_name: 'car' keypoints { id: 0 label: \"x\" } } item{name:\"dog\" id:18}",
            90,
        )
        .unwrap();
        assert_eq!(map.get(3), Some("car"));
        assert_eq!(map.get(18), Some("dog"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(LabelMap::parse("item { id: 0 name: \"bg\" }", 90).is_err());
        assert!(LabelMap::parse("item { name: \"no id\" }", 90).is_err());
        assert!(LabelMap::parse("item { id: 1 name: \"open\"", 90).is_err());
        assert!(LabelMap::parse("item { id: one }", 90).is_err());

        let err = LabelMap::parse("\n\nthing { id: 1 }", 90).unwrap_err();
        assert!(err.to_string().contains("line 3"), "{err}");
    }

    #[test]
    fn label_text_and_colors() {
        assert_eq!(format_label("person", 0.876), "person: 87%");
        assert_eq!(format_label("dog", 1.0), "dog: 100%");
        assert_eq!(class_color(1), class_color(21));
        assert_ne!(class_color(1), class_color(2));
    }
}

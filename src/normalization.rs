use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref LINE_BREAK: Regex = Regex::new(r"(?i)<\s*br\s*/?\s*>").unwrap();
    static ref TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref HTML_ENTITY: Regex =
        Regex::new(r"&(?:#(\d+)|#[xX]([0-9A-Fa-f]+)|([a-zA-Z][a-zA-Z0-9]*));").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Convert comment markup to the plain text sent to the models.
///
/// Line breaks become spaces, tags are stripped, entities decoded, and runs of
/// whitespace collapsed to a single space.
pub fn html_to_text(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    let text = LINE_BREAK.replace_all(html, " ");
    let text = TAG.replace_all(&text, "");
    let text = decode_entities(&text);
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    HTML_ENTITY
        .replace_all(text, |caps: &Captures| {
            let decoded = if let Some(dec) = caps.get(1) {
                dec.as_str().parse::<u32>().ok().and_then(char::from_u32)
            } else if let Some(hex) = caps.get(2) {
                u32::from_str_radix(hex.as_str(), 16)
                    .ok()
                    .and_then(char::from_u32)
            } else {
                caps.get(3).and_then(|name| named_entity(name.as_str()))
            };
            match decoded {
                Some(c) => c.to_string(),
                // Unknown entity, leave it as written
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_tags_and_collapses_whitespace() {
        let html = "<p>I will   <b>find</b>\n\tyou</p>";
        assert_eq!(html_to_text(html), "I will find you");
    }

    #[test]
    fn test_line_breaks_become_spaces() {
        assert_eq!(html_to_text("first<br>second<BR />third"), "first second third");
    }

    #[test]
    fn test_decodes_entities_after_stripping() {
        assert_eq!(html_to_text("a &lt;b&gt; &amp; c&#33;"), "a <b> & c!");
        assert_eq!(html_to_text("&#x41;&nbsp;&unknown;"), "A &unknown;");
    }

    #[test]
    fn test_empty_and_plain_input() {
        assert_eq!(html_to_text(""), "");
        assert_eq!(html_to_text("lol this boss is destroying me"), "lol this boss is destroying me");
        assert_eq!(html_to_text("   <div> </div> "), "");
    }
}

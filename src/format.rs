//! Text reformatting applied to wall posts before publishing.
//!
//! A deterministic pipeline of rewrite passes producing Telegram HTML. The
//! pass order matters: later passes assume the normalisation done by earlier
//! ones. Passes that touch quotes, dashes and punctuation run only outside
//! the anchor markup emitted by the link pass, so URLs survive intact.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

/// Unicode ranges treated as emoji when looking for a header terminator.
const EMOJI: &str = "\\x{1F600}-\\x{1F64F}\\x{1F300}-\\x{1F5FF}\\x{1F680}-\\x{1F6FF}\\x{1F1E0}-\\x{1F1FF}";

lazy_static! {
    static ref EXTRA_LINE_BREAKS: Regex = Regex::new(r"\n{3,}").unwrap();
    static ref INTERNAL_LINK: Regex = Regex::new(r"\[([^|\]]+)\|([^\]]+)\]").unwrap();
    static ref ANCHOR: Regex = Regex::new(r#"<a href="[^"]*">[^<]*</a>"#).unwrap();
    static ref QUOTED: Regex = Regex::new("\"([^\"]+)\"").unwrap();
    static ref SPACED_DASH: Regex = Regex::new(" [-–] ").unwrap();
    static ref LONG_ELLIPSIS: Regex = Regex::new(r"\.{4,}").unwrap();
    static ref BANG_RUN: Regex = Regex::new("!+").unwrap();
    static ref QUESTION_RUN: Regex = Regex::new(r"\?+").unwrap();
    static ref SPACE_BEFORE_CLOSING: Regex = Regex::new(r" +([)\.!?]+)").unwrap();
    static ref SPACES_AFTER_CLOSING: Regex = Regex::new(r"([)\.!?]+)  +").unwrap();
    static ref CLOSING_TIGHT: Regex = Regex::new(r"([)\.!?]+)(\S)").unwrap();
    static ref OPENING_PAREN: Regex = Regex::new(r" ?\( ?").unwrap();
    static ref HEADER: Regex =
        Regex::new(&format!(r"^([\w ,]+(\.\.\.|[\n.!?]|[{EMOJI}]+))")).unwrap();
    static ref EXTRA_SPACES: Regex = Regex::new("  +").unwrap();
}

/// Rewrites raw wall text into channel-ready HTML. Pure and total: empty
/// input yields empty output, a pass without a match is a no-op.
pub fn format_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = collapse_line_breaks(text);
    let text = link_internal_references(&text);
    let text = outside_anchors(&text, fix_quotes);
    let text = outside_anchors(&text, fix_dashes);
    let text = outside_anchors(&text, collapse_punctuation_runs);
    let text = outside_anchors(&text, fix_spacing_near_punctuation);
    let text = emphasize_header(&text);
    // The header pass introduces fresh blank lines.
    let text = collapse_line_breaks(&text);
    let text = EXTRA_SPACES.replace_all(&text, " ");
    let text = text.replace("\n ", "\n");
    text.trim().to_string()
}

/// Applies `pass` to every stretch of text between `<a>…</a>` anchors,
/// leaving the anchors themselves untouched.
fn outside_anchors(text: &str, pass: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut tail = 0;
    for anchor in ANCHOR.find_iter(text) {
        out.push_str(&pass(&text[tail..anchor.start()]));
        out.push_str(anchor.as_str());
        tail = anchor.end();
    }
    out.push_str(&pass(&text[tail..]));
    out
}

fn collapse_line_breaks(text: &str) -> String {
    EXTRA_LINE_BREAKS.replace_all(text, "\n\n").into_owned()
}

/// Turns `[id|label]` and `[domain/id|label]` references into HTML links.
/// A target without a domain part is assumed to live on vk.com.
fn link_internal_references(text: &str) -> String {
    INTERNAL_LINK
        .replace_all(text, |caps: &Captures| {
            let target = caps[1]
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            let label = &caps[2];
            let head = target.split('/').next().unwrap_or_default();
            if head.contains('.') {
                format!("<a href=\"https://{target}\">{label}</a>")
            } else {
                format!("<a href=\"https://vk.com/{target}\">{label}</a>")
            }
        })
        .into_owned()
}

fn fix_quotes(text: &str) -> String {
    QUOTED.replace_all(text, "«$1»").into_owned()
}

fn fix_dashes(text: &str) -> String {
    SPACED_DASH.replace_all(text, " — ").into_owned()
}

fn collapse_punctuation_runs(text: &str) -> String {
    let text = LONG_ELLIPSIS.replace_all(text, "...");
    let text = BANG_RUN.replace_all(&text, "!");
    QUESTION_RUN.replace_all(&text, "?").into_owned()
}

/// No space before `)`, `.`, `!`, `?`; exactly one space after, inserted
/// when missing; a space before an opening `(`.
fn fix_spacing_near_punctuation(text: &str) -> String {
    let text = SPACE_BEFORE_CLOSING.replace_all(text, "$1");
    let text = SPACES_AFTER_CLOSING.replace_all(&text, "$1 ");
    let text = insert_space_after_closing(&text);
    OPENING_PAREN.replace_all(&text, " (").into_owned()
}

/// A dot between two digits is a decimal point, not sentence punctuation.
fn insert_space_after_closing(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut tail = 0;
    for caps in CLOSING_TIGHT.captures_iter(text) {
        let (Some(whole), Some(punct), Some(next)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        let decimal = punct.as_str() == "."
            && next.as_str().chars().all(|c| c.is_ascii_digit())
            && text[..whole.start()].ends_with(|c: char| c.is_ascii_digit());
        out.push_str(&text[tail..punct.end()]);
        if !decimal {
            out.push(' ');
        }
        out.push_str(next.as_str());
        tail = whole.end();
    }
    out.push_str(&text[tail..]);
    out
}

/// Wraps the leading sentence of a multi-line post in `<b>…</b>` followed by
/// a blank line. Single-line posts and posts that do not start with a plain
/// word run are left as they are.
fn emphasize_header(text: &str) -> String {
    if !text.contains('\n') {
        return text.to_string();
    }
    let emphasized = HEADER.replace(text, "<b>$1</b>\n\n");
    // A newline terminator belongs after the closing tag, not inside it.
    emphasized.replace("\n</b>", "</b>")
}

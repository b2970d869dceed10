// src/notify/render.rs
//! Digest → HTML page and plain-text summary.

use std::fmt::Write as _;

use html_escape::{encode_double_quoted_attribute, encode_text};
use once_cell::sync::OnceCell;
use regex::Regex;

use super::Document;
use crate::feed::normalize_text;
use crate::model::{Article, ArticleType, Digest};

const STYLE: &str = "body{font-family:Georgia,serif;max-width:760px;margin:2em auto;padding:0 1em;color:#222}\
header{border-bottom:3px double #222;text-align:center;margin-bottom:1.5em}\
h1{font-size:2.4em;margin:.2em 0}.tagline{font-style:italic;color:#555}\
.meta{font-size:.85em;color:#777}h2{border-bottom:1px solid #aaa;text-transform:uppercase;letter-spacing:.05em}\
article{margin-bottom:1.6em}.sub{color:#444;font-style:italic}.stance{background:#f4f4f4;padding:.4em .8em}\
.sources{font-size:.8em;color:#666}.brief h3{font-size:1em;display:inline}.brief .body{display:inline}";

pub fn render_document(digest: &Digest) -> Document {
    Document {
        subject: subject(digest),
        html: render_html(digest),
        text: render_text(digest),
        generated_at: digest.generated_at,
    }
}

pub fn subject(digest: &Digest) -> String {
    format!("{} | {}", digest.title, digest.period_end.format("%Y-%m-%d"))
}

/// Remove `<script>` / `<style>` elements and inline event handlers from
/// model-written HTML.
pub fn sanitize_body(html: &str) -> String {
    static RE_SCRIPT: OnceCell<Regex> = OnceCell::new();
    let re_script = RE_SCRIPT
        .get_or_init(|| Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>|<(script|style)\b[^>]*/?>").unwrap());
    let out = re_script.replace_all(html, "");

    static RE_HANDLERS: OnceCell<Regex> = OnceCell::new();
    let re_handlers = RE_HANDLERS
        .get_or_init(|| Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap());
    let out = re_handlers.replace_all(&out, "");

    let trimmed = out.trim();
    if trimmed.starts_with('<') {
        trimmed.to_string()
    } else {
        format!("<p>{}</p>", encode_text(trimmed))
    }
}

pub fn render_html(digest: &Digest) -> String {
    let mut h = String::with_capacity(8 * 1024);
    let _ = write!(
        h,
        "<!DOCTYPE html>\n<html lang=\"{}\">\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n",
        encode_double_quoted_attribute(&language_tag(&digest.language)),
        encode_text(&subject(digest)),
    );
    let _ = write!(
        h,
        "<header>\n<h1>{}</h1>\n<p class=\"tagline\">{}</p>\n<p class=\"meta\">{} to {} &middot; {} articles from {} items across {} channels{}</p>\n</header>\n",
        encode_text(&digest.title),
        encode_text(&digest.tagline),
        digest.period_start.format("%Y-%m-%d %H:%M UTC"),
        digest.period_end.format("%Y-%m-%d %H:%M UTC"),
        digest.article_count(),
        digest.items_considered,
        digest.channel_count,
        if digest.degraded { " &middot; partial edition" } else { "" },
    );

    if digest.is_empty() {
        h.push_str("<p>No stories in this period.</p>\n");
    }
    for section in &digest.sections {
        let _ = writeln!(h, "<section>\n<h2>{}</h2>", encode_text(&section.name));
        for article in &section.articles {
            render_article(&mut h, article);
        }
        h.push_str("</section>\n");
    }
    let _ = write!(
        h,
        "<footer class=\"meta\">Edition {} &middot; generated {}</footer>\n</body>\n</html>\n",
        digest.edition_id,
        digest.generated_at.format("%Y-%m-%d %H:%M UTC"),
    );
    h
}

fn render_article(h: &mut String, a: &Article) {
    let brief = a.article_type == ArticleType::Brief;
    let _ = write!(
        h,
        "<article class=\"{}\">\n<h3>{}</h3>\n",
        if brief { "brief" } else { "story" },
        encode_text(&a.headline)
    );
    if let Some(sub) = &a.subheadline {
        let _ = writeln!(h, "<p class=\"sub\">{}</p>", encode_text(sub));
    }
    if let Some(stance) = &a.stance_summary {
        let _ = writeln!(h, "<p class=\"stance\">{}</p>", encode_text(stance));
    }
    let _ = writeln!(h, "<div class=\"body\">{}</div>", sanitize_body(&a.body));

    if !a.sources.is_empty() {
        h.push_str("<p class=\"sources\">Sources: ");
        for (i, s) in a.sources.iter().enumerate() {
            if i > 0 {
                h.push_str(", ");
            }
            match &s.link {
                Some(link) => {
                    let _ = write!(
                        h,
                        "<a href=\"{}\">{}</a>",
                        encode_double_quoted_attribute(link),
                        encode_text(&s.channel_title)
                    );
                }
                None => h.push_str(&encode_text(&s.channel_title)),
            }
        }
        h.push_str("</p>\n");
    }
    h.push_str("</article>\n");
}

pub fn render_text(digest: &Digest) -> String {
    let mut t = String::new();
    let _ = writeln!(t, "{}", digest.title);
    let _ = writeln!(t, "{}", digest.tagline);
    let _ = writeln!(
        t,
        "{} to {}",
        digest.period_start.format("%Y-%m-%d %H:%M"),
        digest.period_end.format("%Y-%m-%d %H:%M UTC")
    );
    if digest.is_empty() {
        t.push_str("\nNo stories in this period.\n");
        return t;
    }
    for section in &digest.sections {
        let _ = write!(t, "\n== {} ==\n", section.name.to_uppercase());
        for a in &section.articles {
            let _ = writeln!(t, "\n* {}", a.headline);
            if a.article_type == ArticleType::Brief {
                let _ = writeln!(t, "  {}", normalize_text(&a.body));
            } else if let Some(sub) = &a.subheadline {
                let _ = writeln!(t, "  {sub}");
            }
        }
    }
    t
}

/// Best-effort BCP 47 tag for common language names.
fn language_tag(language: &str) -> String {
    match language.trim().to_lowercase().as_str() {
        "english" => "en".into(),
        "german" | "deutsch" => "de".into(),
        "french" | "français" => "fr".into(),
        "spanish" | "español" => "es".into(),
        "russian" => "ru".into(),
        "ukrainian" => "uk".into(),
        "czech" | "čeština" => "cs".into(),
        other if other.len() == 2 => other.into(),
        _ => "en".into(),
    }
}

//! Readable-text extraction for a loaded result page.
//!
//! This is deliberately "good enough" and deterministic rather than a full readability
//! engine: the densest non-boilerplate block wins, with a bonus for `article`/`main`.

use tabpipe_core::PageReport;

/// Pages with less collapsed text than this are reported as blocked.
pub const MIN_ARTICLE_CHARS: usize = 100;

pub const REASON_BLOCKED: &str = "blocked";
pub const REASON_ERROR: &str = "error";

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Best-effort guess for whether bytes are HTML-ish.
pub fn bytes_look_like_html(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let rest = &bytes[start..];
    if rest.is_empty() {
        return false;
    }
    let head: Vec<u8> = rest.iter().take(16).map(|b| b.to_ascii_lowercase()).collect();
    [
        b"<!doctype".as_slice(),
        b"<html",
        b"<head",
        b"<body",
        b"<article",
        b"<main",
    ]
    .iter()
    .any(|p| head.starts_with(p))
}

fn class_or_id_lc(el: &html_scraper::ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_boilerplate(el: &html_scraper::ElementRef) -> bool {
    let s = class_or_id_lc(el);
    if s.is_empty() {
        return false;
    }
    [
        "nav", "menu", "sidebar", "footer", "header", "banner", "cookie", "consent", "advert",
        "promo", "newsletter",
    ]
    .iter()
    .any(|bad| s.contains(bad))
}

fn element_text(el: &html_scraper::ElementRef) -> String {
    norm_ws(&el.text().collect::<Vec<_>>().join(" "))
}

fn link_text_chars(el: &html_scraper::ElementRef, links: &html_scraper::Selector) -> usize {
    el.select(links)
        .map(|a| a.text().map(|t| t.chars().count()).sum::<usize>())
        .sum()
}

/// Text of the best content container, falling back to the whole body.
fn pick_main_text(doc: &html_scraper::Html) -> String {
    let Ok(blocks) = html_scraper::Selector::parse("article, main, [role=main], section, div")
    else {
        return String::new();
    };
    let Ok(links) = html_scraper::Selector::parse("a") else {
        return String::new();
    };

    let mut best: Option<(i64, String)> = None;
    for el in doc.select(&blocks) {
        if is_boilerplate(&el) {
            continue;
        }
        let text = element_text(&el);
        let chars = text.chars().count();
        if chars < 20 {
            continue;
        }
        let link_chars = link_text_chars(&el, &links);
        let mut score = chars as i64 - 2 * link_chars as i64;
        match el.value().name() {
            "article" => score += 500,
            "main" => score += 300,
            _ if el.value().attr("role") == Some("main") => score += 300,
            _ => {}
        }
        if link_chars > chars / 2 {
            score -= 500;
        }
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((score, text));
        }
    }

    match best {
        Some((score, text)) if score > 0 => text,
        _ => html_scraper::Selector::parse("body")
            .ok()
            .and_then(|sel| doc.select(&sel).next().map(|b| element_text(&b)))
            .unwrap_or_default(),
    }
}

fn first_text(doc: &html_scraper::Html, selector: &str) -> Option<String> {
    let sel = html_scraper::Selector::parse(selector).ok()?;
    let t = element_text(&doc.select(&sel).next()?);
    (!t.is_empty()).then_some(t)
}

/// Turn a loaded HTML page into the worker's report.
pub fn report_from_html(url: &str, html: &str) -> PageReport {
    let doc = html_scraper::Html::parse_document(html);
    let title = first_text(&doc, "title")
        .or_else(|| first_text(&doc, "h1"))
        .unwrap_or_default();
    let content = pick_main_text(&doc);
    if content.chars().count() < MIN_ARTICLE_CHARS {
        return PageReport {
            url: url.to_string(),
            title,
            content: String::new(),
            blocked: true,
            reason: Some(REASON_BLOCKED.to_string()),
        };
    }
    PageReport {
        url: url.to_string(),
        title,
        content,
        blocked: false,
        reason: None,
    }
}

/// The report for a page that could not be read at all.
pub fn error_report(url: &str, title: &str) -> PageReport {
    PageReport {
        url: url.to_string(),
        title: title.to_string(),
        content: String::new(),
        blocked: true,
        reason: Some(REASON_ERROR.to_string()),
    }
}

/// Dispatch on content type: HTML is extracted, plain text is taken as-is, anything else
/// is an extraction error.
pub fn report_from_body(url: &str, content_type: Option<&str>, body: &[u8]) -> PageReport {
    let ct = content_type
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if ct.contains("html") || (ct.is_empty() && bytes_look_like_html(body)) {
        return report_from_html(url, &String::from_utf8_lossy(body));
    }
    if ct.starts_with("text/") {
        let content = norm_ws(&String::from_utf8_lossy(body));
        if content.chars().count() < MIN_ARTICLE_CHARS {
            return PageReport {
                reason: Some(REASON_BLOCKED.to_string()),
                ..error_report(url, "")
            };
        }
        return PageReport {
            url: url.to_string(),
            title: String::new(),
            content,
            blocked: false,
            reason: None,
        };
    }
    error_report(url, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabpipe_core::SiteStatus;

    const LOREM: &str = "Rust ownership rules guarantee memory safety without a garbage \
        collector, and the borrow checker enforces them at compile time for every crate.";

    #[test]
    fn article_text_wins_over_navigation() {
        let html = format!(
            r#"<html><head><title> Ownership
               explained </title></head><body>
              <nav class="nav"><a href="/x">Home</a> <a href="/y">Docs</a></nav>
              <article><h1>Ownership</h1><p>{LOREM}</p><p>More   text here.</p></article>
              <footer class="footer"><a href="/p">Privacy policy and terms</a></footer>
            </body></html>"#
        );
        let r = report_from_html("https://example.com/own", &html);
        assert!(!r.blocked);
        assert_eq!(r.title, "Ownership explained");
        assert!(r.content.starts_with("Ownership Rust ownership rules"));
        assert!(r.content.ends_with("More text here."));
        assert!(!r.content.contains("Privacy"));
        assert_eq!(r.site_status(), SiteStatus::Loaded);
    }

    #[test]
    fn short_pages_are_blocked() {
        let r = report_from_html(
            "https://example.com/",
            "<html><head><title>Just a moment...</title></head><body><p>Checking your browser</p></body></html>",
        );
        assert!(r.blocked);
        assert_eq!(r.reason.as_deref(), Some(REASON_BLOCKED));
        assert!(r.content.is_empty());
        assert_eq!(r.title, "Just a moment...");
    }

    #[test]
    fn body_is_used_when_no_container_stands_out() {
        let html = format!("<html><body>{LOREM}</body></html>");
        let r = report_from_html("https://example.com/", &html);
        assert_eq!(r.content, LOREM.split_whitespace().collect::<Vec<_>>().join(" "));
        assert_eq!(r.title, "");
    }

    #[test]
    fn title_falls_back_to_h1() {
        let html = format!("<html><body><main><h1>Heading</h1><p>{LOREM}</p></main></body></html>");
        assert_eq!(report_from_html("https://e/", &html).title, "Heading");
    }

    #[test]
    fn bodies_dispatch_on_content_type() {
        let html = format!("<!DOCTYPE html><html><body><article>{LOREM}</article></body></html>");
        assert!(!report_from_body("u", Some("text/html; charset=utf-8"), html.as_bytes()).blocked);
        assert!(!report_from_body("u", None, html.as_bytes()).blocked);
        assert!(!report_from_body("u", Some("text/plain"), LOREM.as_bytes()).blocked);

        let short = report_from_body("u", Some("text/plain"), b"tiny");
        assert_eq!(short.site_status(), SiteStatus::Blocked);

        let pdf = report_from_body("u", Some("application/pdf"), b"%PDF-1.7");
        assert_eq!(pdf.site_status(), SiteStatus::Error);
        assert_eq!(error_report("u", "t").reason.as_deref(), Some(REASON_ERROR));
    }

    #[test]
    fn html_sniffing_is_conservative() {
        assert!(bytes_look_like_html(b"  <!doctype html><html>"));
        assert!(bytes_look_like_html(b"<HTML><body>x</body></HTML>"));
        assert!(!bytes_look_like_html(br#"{"a":1}"#));
        assert!(!bytes_look_like_html(b""));
    }
}

//! Result-link scraping for the search-engine page.

use tabpipe_core::Candidate;

/// Result anchors on DuckDuckGo's JS page and its HTML-only page.
const RESULT_ANCHORS: &str = r#"a[data-testid="result-title-a"], a.result__a"#;

/// Resolve `href` against the page and unwrap DuckDuckGo's `/l/?uddg=` redirect links.
pub fn resolve_result_href(base: &url::Url, href: &str) -> Option<String> {
    let u = base.join(href.trim()).ok()?;
    let is_ddg = u
        .host_str()
        .is_some_and(|h| h == "duckduckgo.com" || h.ends_with(".duckduckgo.com"));
    if is_ddg && u.path().starts_with("/l/") {
        let target = u
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned())?;
        return resolve_result_href(base, &target);
    }
    matches!(u.scheme(), "http" | "https").then(|| u.to_string())
}

/// Result links in page order, at most `max_results`.
pub fn parse_candidates(html: &str, page_url: &str, max_results: usize) -> Vec<Candidate> {
    let Ok(base) = url::Url::parse(page_url) else {
        return Vec::new();
    };
    let Ok(sel) = html_scraper::Selector::parse(RESULT_ANCHORS) else {
        return Vec::new();
    };
    let doc = html_scraper::Html::parse_document(html);
    doc.select(&sel)
        .filter_map(|a| {
            let url = resolve_result_href(&base, a.value().attr("href")?)?;
            let title = a
                .text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            Some(Candidate { title, url })
        })
        .take(max_results)
        .collect()
}

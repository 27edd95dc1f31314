use scraper::{Html, Selector};
use url::Url;

/// A parsed HTML page: concatenated visible text and the outbound links
/// found on it, resolved against the page's final URL.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub text: String,
    pub links: Vec<String>,
}

pub struct Parser;

impl Parser {
    /// Extract visible text (script/style excluded, whitespace collapsed)
    /// and every `<a href>` resolved against `base_url`.
    pub fn parse(html_content: &str, base_url: &str) -> ParsedPage {
        let document = Html::parse_document(html_content);
        let base = Url::parse(base_url).ok();

        ParsedPage {
            text: Self::extract_text(&document),
            links: Self::extract_links(&document, &base),
        }
    }

    fn extract_text(document: &Html) -> String {
        let body_sel = Selector::parse("body").unwrap();
        let mut raw = String::new();
        if let Some(body) = document.select(&body_sel).next() {
            collect_text_excluding(&body, &mut raw);
        }
        raw.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn extract_links(document: &Html, base: &Option<Url>) -> Vec<String> {
        let sel = Selector::parse("a[href]").unwrap();
        let mut links = Vec::new();

        for el in document.select(&sel) {
            let Some(href) = el.value().attr("href") else { continue };
            let resolved = match base {
                Some(base) => base.join(href).ok(),
                None => Url::parse(href).ok(),
            };
            if let Some(url) = resolved {
                links.push(url.to_string());
            }
        }

        links
    }
}

/// Recursively collect text, skipping `script`/`style` subtrees.
fn collect_text_excluding(node: &scraper::ElementRef, out: &mut String) {
    for child in node.children() {
        if let Some(text) = child.value().as_text() {
            out.push(' ');
            out.push_str(text);
        } else if let Some(el) = scraper::ElementRef::wrap(child) {
            let tag = el.value().name();
            if tag != "script" && tag != "style" {
                collect_text_excluding(&el, out);
            }
        }
    }
}

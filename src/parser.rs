//! The Parser contract (spec §6.2) and the [`PageElement`] view steps query
//! against (spec §6.3).
//!
//! No XPath engine exists anywhere in this crate's dependency lineage, so
//! `query_xpath` is backed by the `scraper` crate's CSS selector engine —
//! a deliberate, disclosed substitution (see DESIGN.md), not a silent one.
//! Selector *strings* passed to these methods are CSS selectors throughout.

use std::fmt;
use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

/// Errors the Parser contract may raise (spec §6.2): malformed input, or a
/// counted-selector violation (spec §4.4.4), surfaced with enough detail to
/// become a stored `Error` row of type `xpath`.
#[derive(Debug, Error, Clone)]
pub enum ParseError {
    #[error("response body is not valid UTF-{0}")]
    Encoding(u8),

    #[error("response body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("structural assumption violated: {description}")]
    Structural {
        selector: String,
        description: String,
        expected_min: i64,
        expected_max: Option<i64>,
        actual_count: i64,
        sample_text: String,
    },
}

/// `parse_html(bytes, encoding) -> PageElement`, `parse_json(bytes) -> Value` (spec §6.2).
pub trait Parser: Send + Sync {
    fn parse_html(&self, bytes: &[u8], encoding: &str) -> Result<PageElement, ParseError>;
    fn parse_json(&self, bytes: &[u8]) -> Result<serde_json::Value, ParseError>;
}

/// Composes the ancestry chain of selectors used to reach the current node,
/// so a structural error can report an absolute selector rather than just
/// the final query (spec §4.4.4).
#[derive(Debug, Clone, Default)]
pub struct SelectorObserver {
    chain: Vec<String>,
}

impl SelectorObserver {
    pub fn root() -> Self {
        Self { chain: Vec::new() }
    }

    /// A new observer with `selector` appended to this one's chain — used
    /// when a query descends into a previously-queried element.
    pub fn descend(&self, selector: &str) -> Self {
        let mut chain = self.chain.clone();
        chain.push(selector.to_string());
        Self { chain }
    }

    /// The composed absolute selector, e.g. `.listing > .item:nth-child(2)`.
    pub fn absolute(&self) -> String {
        self.chain.join(" ")
    }
}

impl fmt::Display for SelectorObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.absolute())
    }
}

/// How a [`Form`] or [`Link`] was reached — lets a browser-driven Fetcher
/// replay the UI action instead of issuing a raw HTTP request (spec §6.3).
/// The bundled `HttpFetcher` ignores this entirely.
#[derive(Debug, Clone)]
pub enum Via {
    ViaLink { selector: String },
    ViaFormSubmit { selector: String },
}

/// An immutable view over a `<form>` element (spec §6.3).
#[derive(Debug, Clone)]
pub struct Form {
    pub action: String,
    pub method: String,
    pub fields: Vec<(String, String)>,
    pub via: Via,
}

impl Form {
    /// Build a ready-to-enqueue request description, overriding/adding the
    /// given field values on top of the form's defaults.
    pub fn submit(&self, overrides: Option<&[(String, String)]>) -> FormSubmission {
        let mut fields = self.fields.clone();
        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                if let Some(existing) = fields.iter_mut().find(|(k, _)| k == key) {
                    existing.1 = value.clone();
                } else {
                    fields.push((key.clone(), value.clone()));
                }
            }
        }
        FormSubmission {
            action: self.action.clone(),
            method: self.method.clone(),
            fields,
        }
    }
}

/// The materialised result of [`Form::submit`] — everything the Scheduler
/// needs to build a [`crate::model::NewRequest`].
#[derive(Debug, Clone)]
pub struct FormSubmission {
    pub action: String,
    pub method: String,
    pub fields: Vec<(String, String)>,
}

/// An immutable view over an `<a>` element (spec §6.3).
#[derive(Debug, Clone)]
pub struct Link {
    pub href: String,
    pub text: String,
    pub via: Via,
}

impl Link {
    pub fn follow(&self) -> String {
        self.href.clone()
    }
}

/// Driver-agnostic view of parsed HTML (spec §6.3), backed by `scraper`.
///
/// Wraps the parsed document behind an `Arc` so cloning a `PageElement` (to
/// pass one per descended query) is cheap; the selected fragment is the root
/// of the document unless produced by a prior `query_css`/`query_xpath`.
#[derive(Clone)]
pub struct PageElement {
    document: Arc<Html>,
    fragment_selector: Option<String>,
    observer: SelectorObserver,
}

impl PageElement {
    pub fn parse(html: &str) -> Self {
        Self {
            document: Arc::new(Html::parse_document(html)),
            fragment_selector: None,
            observer: SelectorObserver::root(),
        }
    }

    fn root_element(&self) -> ElementRef<'_> {
        match &self.fragment_selector {
            None => self.document.root_element(),
            Some(sel) => {
                let selector = Selector::parse(sel).expect("previously-validated selector");
                self.document
                    .select(&selector)
                    .next()
                    .expect("fragment selector matched at construction")
            }
        }
    }

    /// CSS-backed stand-in for an XPath query (see module docs). Enforces
    /// the counted-selector contract from spec §4.4.4.
    pub fn query_xpath(
        &self,
        selector: &str,
        description: &str,
        min_count: i64,
        max_count: Option<i64>,
    ) -> Result<Vec<PageElement>, ParseError> {
        self.query_css(selector, description, min_count, max_count)
    }

    pub fn query_xpath_strings(
        &self,
        selector: &str,
        description: &str,
        min_count: i64,
        max_count: Option<i64>,
    ) -> Result<Vec<String>, ParseError> {
        let matches = self.query_css(selector, description, min_count, max_count)?;
        Ok(matches.iter().map(|el| el.text_content()).collect())
    }

    pub fn query_css(
        &self,
        selector: &str,
        description: &str,
        min_count: i64,
        max_count: Option<i64>,
    ) -> Result<Vec<PageElement>, ParseError> {
        let parsed = Selector::parse(selector).map_err(|e| ParseError::Structural {
            selector: selector.to_string(),
            description: description.to_string(),
            expected_min: min_count,
            expected_max: max_count,
            actual_count: 0,
            sample_text: format!("invalid selector: {e:?}"),
        })?;

        let matched: Vec<ElementRef<'_>> = self.root_element().select(&parsed).collect();
        let actual_count = matched.len() as i64;

        let violates_min = actual_count < min_count;
        let violates_max = max_count.is_some_and(|max| actual_count > max);
        if violates_min || violates_max {
            let sample_text = matched
                .first()
                .map(|el| el.text().collect::<String>())
                .unwrap_or_default();
            return Err(ParseError::Structural {
                selector: self.observer.descend(selector).absolute(),
                description: description.to_string(),
                expected_min: min_count,
                expected_max: max_count,
                actual_count,
                sample_text,
            });
        }

        let child_observer = self.observer.descend(selector);
        Ok(matched
            .into_iter()
            .map(|el| PageElement {
                document: Arc::clone(&self.document),
                fragment_selector: Some(selector_for(el)),
                observer: child_observer.clone(),
            })
            .collect())
    }

    pub fn text_content(&self) -> String {
        self.root_element().text().collect()
    }

    pub fn get_attribute(&self, name: &str) -> Option<String> {
        self.root_element().value().attr(name).map(String::from)
    }

    pub fn inner_html(&self) -> String {
        self.root_element().inner_html()
    }

    pub fn tag_name(&self) -> String {
        self.root_element().value().name().to_string()
    }

    pub fn find_form(&self, selector: &str, description: &str) -> Result<Form, ParseError> {
        let matches = self.query_css(selector, description, 1, Some(1))?;
        let form_el = matches[0].root_element();
        let action = form_el.value().attr("action").unwrap_or("").to_string();
        let method = form_el
            .value()
            .attr("method")
            .unwrap_or("GET")
            .to_uppercase();

        let input_selector = Selector::parse("input[name]").expect("static selector");
        let fields = form_el
            .select(&input_selector)
            .filter_map(|input| {
                let name = input.value().attr("name")?.to_string();
                let value = input.value().attr("value").unwrap_or("").to_string();
                Some((name, value))
            })
            .collect();

        Ok(Form {
            action,
            method,
            fields,
            via: Via::ViaFormSubmit {
                selector: selector.to_string(),
            },
        })
    }

    pub fn find_links(
        &self,
        selector: &str,
        description: &str,
        min_count: i64,
        max_count: Option<i64>,
    ) -> Result<Vec<Link>, ParseError> {
        let matches = self.query_css(selector, description, min_count, max_count)?;
        Ok(matches
            .iter()
            .map(|el| {
                let root = el.root_element();
                Link {
                    href: root.value().attr("href").unwrap_or("").to_string(),
                    text: root.text().collect(),
                    via: Via::ViaLink {
                        selector: selector.to_string(),
                    },
                }
            })
            .collect())
    }

    pub fn links(&self) -> Vec<Link> {
        self.find_links("a[href]", "all links", 0, None).unwrap_or_default()
    }
}

fn selector_for(el: ElementRef<'_>) -> String {
    let id_attr = el.value().id();
    if let Some(id) = id_attr {
        return format!("#{id}");
    }
    el.value().name().to_string()
}

/// Default `Parser` implementation: `scraper` for HTML, `serde_json` for JSON.
pub struct DefaultParser;

impl Parser for DefaultParser {
    fn parse_html(&self, bytes: &[u8], encoding: &str) -> Result<PageElement, ParseError> {
        if !encoding.eq_ignore_ascii_case("utf-8") {
            return Err(ParseError::Encoding(8));
        }
        let text = std::str::from_utf8(bytes).map_err(|_| ParseError::Encoding(8))?;
        Ok(PageElement::parse(text))
    }

    fn parse_json(&self, bytes: &[u8]) -> Result<serde_json::Value, ParseError> {
        serde_json::from_slice(bytes).map_err(|e| ParseError::InvalidJson(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <html><body>
            <div class="listing">
                <div class="item"><a href="/item/1">One</a></div>
                <div class="item"><a href="/item/2">Two</a></div>
            </div>
            <form action="/search" method="get">
                <input name="q" value="" />
            </form>
        </body></html>
    "#;

    #[test]
    fn query_css_within_min_max_succeeds() {
        let page = PageElement::parse(SAMPLE);
        let items = page.query_css(".item", "listing items", 2, Some(2)).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn query_css_violating_min_count_is_structural() {
        let page = PageElement::parse(SAMPLE);
        let err = page.query_css(".missing", "m", 1, None).unwrap_err();
        match err {
            ParseError::Structural {
                selector,
                expected_min,
                actual_count,
                ..
            } => {
                assert_eq!(selector, ".missing");
                assert_eq!(expected_min, 1);
                assert_eq!(actual_count, 0);
            }
            other => panic!("expected Structural, got {other:?}"),
        }
    }

    #[test]
    fn find_links_extracts_href_and_text() {
        let page = PageElement::parse(SAMPLE);
        let links = page.find_links(".item a", "item links", 2, Some(2)).unwrap();
        assert_eq!(links[0].href, "/item/1");
        assert_eq!(links[0].text, "One");
    }

    #[test]
    fn find_form_extracts_action_and_fields() {
        let page = PageElement::parse(SAMPLE);
        let form = page.find_form("form", "search form").unwrap();
        assert_eq!(form.action, "/search");
        assert_eq!(form.fields, vec![("q".to_string(), "".to_string())]);
        let submission = form.submit(Some(&[("q".to_string(), "rust".to_string())]));
        assert_eq!(submission.fields, vec![("q".to_string(), "rust".to_string())]);
    }

    #[test]
    fn default_parser_round_trips_json() {
        let parser = DefaultParser;
        let value = parser.parse_json(br#"{"a":1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn default_parser_rejects_invalid_json() {
        let parser = DefaultParser;
        assert!(parser.parse_json(b"not json").is_err());
    }
}

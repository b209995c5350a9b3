//! HTML element navigation for parse callbacks.
//!
//! [`HtmlElement`] is a handle to one node of the parsed response document.
//! Navigation comes in two flavours:
//! - strict methods (`text`, `attr`, `child_text`, ...) return
//!   [`ParseError::NodeNotFound`] when nothing matches, carrying the chain
//!   of selector rules attempted so far;
//! - lenient `may_`-prefixed methods return empty values instead.
//!
//! Callbacks are expected to propagate strict misses with `?`; the parse
//! worker's error dispatch then decides whether the command is retried.

use scraper::{ElementRef, Selector};

use crate::error::{ParseError, ParseResult, SelectorTrail};

/// Compiles a CSS selector, mapping malformed selectors to a parse error.
pub(crate) fn parse_selector(selector: &str) -> ParseResult<Selector> {
    Selector::parse(selector)
        .map_err(|e| ParseError::html(format!("invalid selector {selector:?}: {e}")))
}

/// Handle to a subtree of the parsed response document.
#[derive(Debug, Clone, Copy)]
pub struct HtmlElement<'a> {
    element: ElementRef<'a>,
    trail: &'a SelectorTrail,
}

impl<'a> HtmlElement<'a> {
    pub(crate) fn new(element: ElementRef<'a>, trail: &'a SelectorTrail) -> Self {
        Self { element, trail }
    }

    /// The selector rules that were followed to reach this element.
    #[must_use]
    pub fn trail(&self) -> &SelectorTrail {
        self.trail
    }

    /// Concatenated text of this element and its descendants.
    #[must_use]
    pub fn text(&self) -> String {
        self.element.text().collect()
    }

    /// Attribute value on this element.
    ///
    /// # Errors
    ///
    /// [`ParseError::NodeNotFound`] if the attribute is absent.
    pub fn attr(&self, key: &str) -> ParseResult<String> {
        self.element.value().attr(key).map_or_else(
            || Err(ParseError::node_not_found(self.trail.push("attrname", key))),
            |value| Ok(value.to_string()),
        )
    }

    /// Attribute value on this element, or the empty string when absent.
    #[must_use]
    pub fn may_attr(&self, key: &str) -> String {
        self.element
            .value()
            .attr(key)
            .unwrap_or_default()
            .to_string()
    }

    /// Text of the first descendant matching `selector`.
    ///
    /// # Errors
    ///
    /// [`ParseError::NodeNotFound`] if nothing matches, [`ParseError::Html`]
    /// on a malformed selector.
    pub fn child_text(&self, selector: &str) -> ParseResult<String> {
        let sel = parse_selector(selector)?;
        self.element.select(&sel).next().map_or_else(
            || {
                Err(ParseError::node_not_found(
                    self.trail.push("selector", selector),
                ))
            },
            |child| Ok(child.text().collect()),
        )
    }

    /// Text of the first descendant matching `selector`, or empty.
    ///
    /// # Errors
    ///
    /// Only [`ParseError::Html`] on a malformed selector.
    pub fn may_child_text(&self, selector: &str) -> ParseResult<String> {
        let sel = parse_selector(selector)?;
        Ok(self
            .element
            .select(&sel)
            .next()
            .map(|child| child.text().collect())
            .unwrap_or_default())
    }

    /// Attribute of the first descendant matching `selector`.
    ///
    /// # Errors
    ///
    /// [`ParseError::NodeNotFound`] if the selector misses or the attribute
    /// is absent on the matched element.
    pub fn child_attr(&self, selector: &str, key: &str) -> ParseResult<String> {
        let sel = parse_selector(selector)?;
        let Some(child) = self.element.select(&sel).next() else {
            return Err(ParseError::node_not_found(
                self.trail.push("selector", selector),
            ));
        };
        child.value().attr(key).map_or_else(
            || {
                Err(ParseError::node_not_found(
                    self.trail.push("selector", selector).push("attrname", key),
                ))
            },
            |value| Ok(value.to_string()),
        )
    }

    /// Attribute of the first descendant matching `selector`, or empty.
    ///
    /// # Errors
    ///
    /// Only [`ParseError::Html`] on a malformed selector.
    pub fn may_child_attr(&self, selector: &str, key: &str) -> ParseResult<String> {
        let sel = parse_selector(selector)?;
        Ok(self
            .element
            .select(&sel)
            .next()
            .and_then(|child| child.value().attr(key))
            .unwrap_or_default()
            .to_string())
    }

    /// Texts of every descendant matching `selector`.
    ///
    /// # Errors
    ///
    /// [`ParseError::NodeNotFound`] if nothing matches.
    pub fn children_texts(&self, selector: &str) -> ParseResult<Vec<String>> {
        let texts = self.may_children_texts(selector)?;
        if texts.is_empty() {
            return Err(ParseError::node_not_found(
                self.trail.push("selector", selector),
            ));
        }
        Ok(texts)
    }

    /// Texts of every descendant matching `selector`; empty when none match.
    ///
    /// # Errors
    ///
    /// Only [`ParseError::Html`] on a malformed selector.
    pub fn may_children_texts(&self, selector: &str) -> ParseResult<Vec<String>> {
        let sel = parse_selector(selector)?;
        Ok(self
            .element
            .select(&sel)
            .map(|child| child.text().collect())
            .collect())
    }

    /// Attribute values of every descendant matching `selector`.
    ///
    /// # Errors
    ///
    /// [`ParseError::NodeNotFound`] if nothing matches or any matched
    /// element lacks the attribute.
    pub fn children_attrs(&self, selector: &str, key: &str) -> ParseResult<Vec<String>> {
        let sel = parse_selector(selector)?;
        let mut attrs = Vec::new();
        let mut matched = false;
        for child in self.element.select(&sel) {
            matched = true;
            match child.value().attr(key) {
                Some(value) => attrs.push(value.to_string()),
                None => {
                    return Err(ParseError::node_not_found(
                        self.trail.push("selector", selector).push("attrname", key),
                    ));
                }
            }
        }
        if !matched {
            return Err(ParseError::node_not_found(
                self.trail.push("selector", selector),
            ));
        }
        Ok(attrs)
    }

    /// Attribute values of every descendant matching `selector`; empty when
    /// none match or any matched element lacks the attribute.
    ///
    /// # Errors
    ///
    /// Only [`ParseError::Html`] on a malformed selector.
    pub fn may_children_attrs(&self, selector: &str, key: &str) -> ParseResult<Vec<String>> {
        let sel = parse_selector(selector)?;
        let mut attrs = Vec::new();
        for child in self.element.select(&sel) {
            match child.value().attr(key) {
                Some(value) => attrs.push(value.to_string()),
                None => return Ok(Vec::new()),
            }
        }
        Ok(attrs)
    }

    /// Invokes `f` on every descendant matching `selector`.
    ///
    /// # Errors
    ///
    /// [`ParseError::NodeNotFound`] if nothing matches; any error from `f`
    /// is propagated.
    pub fn for_each<F>(&self, selector: &str, f: F) -> ParseResult<usize>
    where
        F: FnMut(&HtmlElement<'_>) -> ParseResult<()>,
    {
        let count = self.may_for_each(selector, f)?;
        if count == 0 {
            return Err(ParseError::node_not_found(
                self.trail.push("selector", selector),
            ));
        }
        Ok(count)
    }

    /// Invokes `f` on every descendant matching `selector`; zero matches is
    /// not an error.
    ///
    /// # Errors
    ///
    /// [`ParseError::Html`] on a malformed selector; any error from `f` is
    /// propagated.
    pub fn may_for_each<F>(&self, selector: &str, mut f: F) -> ParseResult<usize>
    where
        F: FnMut(&HtmlElement<'_>) -> ParseResult<()>,
    {
        let sel = parse_selector(selector)?;
        let child_trail = self.trail.push("selector", selector);
        let mut count = 0;
        for child in self.element.select(&sel) {
            count += 1;
            f(&HtmlElement::new(child, &child_trail))?;
        }
        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use scraper::Html;

    const FIXTURE: &str = r#"
        <html><body>
          <ul class="list">
            <li><a href="/detail/1">One</a><span class="tag">t1</span></li>
            <li><a href="/detail/2">Two</a><span class="tag">t2</span></li>
            <li><a>Three</a></li>
          </ul>
          <div id="meta" data-page="4">Meta</div>
        </body></html>
    "#;

    fn with_root<T>(f: impl FnOnce(&HtmlElement<'_>) -> T) -> T {
        let doc = Html::parse_document(FIXTURE);
        let trail = SelectorTrail::new().push("selector", "html");
        let root = HtmlElement::new(doc.root_element(), &trail);
        f(&root)
    }

    #[test]
    fn test_text_concatenates_descendants() {
        with_root(|root| {
            let text = root.child_text("#meta").unwrap();
            assert_eq!(text, "Meta");
        });
    }

    #[test]
    fn test_attr_strict_and_lenient() {
        with_root(|root| {
            root.for_each("#meta", |el| {
                assert_eq!(el.attr("data-page").unwrap(), "4");
                assert!(matches!(
                    el.attr("missing"),
                    Err(ParseError::NodeNotFound { .. })
                ));
                assert_eq!(el.may_attr("missing"), "");
                Ok(())
            })
            .unwrap();
        });
    }

    #[test]
    fn test_child_text_miss_carries_trail() {
        with_root(|root| {
            let err = root.child_text("div.absent").unwrap_err();
            match err {
                ParseError::NodeNotFound { trail } => {
                    assert!(trail.to_string().contains("div.absent"));
                    assert!(trail.to_string().contains("html"));
                }
                other => panic!("expected NodeNotFound, got {other:?}"),
            }
        });
    }

    #[test]
    fn test_child_attr_missing_attribute_is_strict_miss() {
        with_root(|root| {
            assert!(matches!(
                root.child_attr("ul.list", "href"),
                Err(ParseError::NodeNotFound { .. })
            ));
            assert_eq!(root.may_child_attr("ul.list", "href").unwrap(), "");
        });
    }

    #[test]
    fn test_children_texts() {
        with_root(|root| {
            let texts = root.children_texts("span.tag").unwrap();
            assert_eq!(texts, vec!["t1", "t2"]);
            assert!(root.children_texts("span.absent").is_err());
            assert!(root.may_children_texts("span.absent").unwrap().is_empty());
        });
    }

    #[test]
    fn test_children_attrs_requires_attr_on_every_match() {
        with_root(|root| {
            // The third <a> has no href, so the strict variant fails...
            assert!(matches!(
                root.children_attrs("li a", "href"),
                Err(ParseError::NodeNotFound { .. })
            ));
            // ...and the lenient variant returns nothing.
            assert!(root.may_children_attrs("li a", "href").unwrap().is_empty());

            // Restricting to anchors that have the attribute succeeds.
            let hrefs = root.children_attrs("li a[href]", "href").unwrap();
            assert_eq!(hrefs, vec!["/detail/1", "/detail/2"]);
        });
    }

    #[test]
    fn test_for_each_counts_and_propagates() {
        with_root(|root| {
            let mut seen = Vec::new();
            let count = root
                .for_each("li", |el| {
                    seen.push(el.child_text("a")?);
                    Ok(())
                })
                .unwrap();
            assert_eq!(count, 3);
            assert_eq!(seen, vec!["One", "Two", "Three"]);

            assert!(root.for_each("li.absent", |_| Ok(())).is_err());
            assert_eq!(root.may_for_each("li.absent", |_| Ok(())).unwrap(), 0);
        });
    }

    #[test]
    fn test_for_each_nested_trail_grows() {
        with_root(|root| {
            root.for_each("li", |li| {
                if let Err(ParseError::NodeNotFound { trail }) = li.child_text("em.absent") {
                    let rendered = trail.to_string();
                    assert!(rendered.contains("li"), "got: {rendered}");
                    assert!(rendered.contains("em.absent"), "got: {rendered}");
                    Ok(())
                } else {
                    panic!("expected strict miss");
                }
            })
            .unwrap();
        });
    }

    #[test]
    fn test_malformed_selector_is_html_error() {
        with_root(|root| {
            assert!(matches!(
                root.child_text("][broken"),
                Err(ParseError::Html { .. })
            ));
        });
    }
}

use chromiumoxide::Page;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::debug;

/// DOM attribute used to tag interactive elements. Refs are only valid
/// for the snapshot that issued them; every snapshot clears old tags and
/// renumbers from 1.
pub const TAG_ATTR: &str = "data-agent-ref";

/// Finds visible interactive and content elements, tags each with a
/// numeric ref, and returns `{ref, role, name}` descriptors. Also picks
/// up `cursor: pointer` divs/spans so script-driven widgets without
/// native roles stay reachable.
const TAGGING_SCRIPT: &str = r#"
(() => {
    document.querySelectorAll('[data-agent-ref]').forEach(el => el.removeAttribute('data-agent-ref'));

    let count = 0;
    const selectors = [
        'button', 'input:not([type="hidden"])', 'select', 'textarea', 'a',
        '[role="button"]', '[role="link"]', '[role="checkbox"]', '[role="menuitem"]',
        '[role="option"]', '[role="combobox"]', '[role="listbox"]',
        '[aria-haspopup]', '[aria-expanded]', '[onclick]',
        'h1', 'h2', 'h3', 'p', 'span', 'label'
    ].join(',');

    const visible = el => {
        const style = window.getComputedStyle(el);
        return style.display !== 'none' &&
               style.visibility !== 'hidden' &&
               el.offsetWidth > 0 &&
               el.offsetHeight > 0;
    };

    const elements = Array.from(document.querySelectorAll(selectors)).filter(visible);

    const pointerElements = Array.from(
        document.querySelectorAll('div[class], span[class]')
    ).filter(el => {
        const style = window.getComputedStyle(el);
        const text = (el.innerText || '').trim();
        return style.cursor === 'pointer' &&
               visible(el) &&
               text.length > 0 &&
               text.length < 300 &&
               !el.hasAttribute('data-agent-ref');
    });

    return [...elements, ...pointerElements].map(el => {
        const ref = String(++count);
        el.setAttribute('data-agent-ref', ref);
        return {
            ref: ref,
            role: el.role || el.tagName.toLowerCase(),
            name: (el.innerText || el.ariaLabel || el.placeholder || el.value || '').trim().substring(0, 80)
        };
    });
})()
"#;

#[derive(Debug, Error)]
pub enum RefError {
    #[error("unknown ref '{0}': refs are only valid for the latest page state; call get_page_state again")]
    InvalidReference(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct TaggedElement {
    #[serde(rename = "ref")]
    pub ref_id: String,
    pub role: String,
    pub name: String,
}

// ========================= Ref Map =========================

/// Ref-to-selector index for the most recent snapshot. Fully rebuilt on
/// every snapshot, so any ref minted earlier resolves to an error rather
/// than a possibly-recycled element.
#[derive(Default)]
pub struct RefMap {
    selectors: HashMap<String, String>,
}

impl RefMap {
    pub fn rebuild(&mut self, elements: &[TaggedElement]) {
        self.selectors = elements
            .iter()
            .map(|el| {
                (
                    el.ref_id.clone(),
                    format!("[{TAG_ATTR}=\"{}\"]", el.ref_id),
                )
            })
            .collect();
    }

    pub fn selector(&self, ref_id: &str) -> Result<&str, RefError> {
        self.selectors
            .get(ref_id)
            .map(String::as_str)
            .ok_or_else(|| RefError::InvalidReference(ref_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }
}

// ========================= Page Index =========================

/// Snapshot of the page the model reads: metadata plus the tagged
/// element roster rendered as text.
#[derive(Clone, Debug)]
pub struct SnapshotReport {
    pub title: String,
    pub url: String,
    pub elements: Vec<TaggedElement>,
    pub body_text: String,
}

impl SnapshotReport {
    pub fn page_state_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "--- PAGE STATE ---");
        let _ = writeln!(out, "Title: {}", self.title);
        let _ = writeln!(out, "URL: {}", self.url);
        let _ = writeln!(out);
        let _ = writeln!(out, "--- INTERACTIVE & CONTENT ELEMENTS (with refs) ---");
        for el in &self.elements {
            let _ = writeln!(out, "- {} \"{}\" [ref=\"{}\"]", el.role, el.name, el.ref_id);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "--- PAGE TEXT ---");
        let _ = writeln!(out, "{}", self.body_text);
        let _ = writeln!(out);
        let _ = writeln!(out, "--- GUIDANCE ---");
        let _ = writeln!(
            out,
            "Use the 'ref' from the list above for your tool calls (click, type, fill_form)."
        );
        let _ = write!(out, "Example: click(ref=\"5\")");
        out
    }
}

/// Live index over one page. Owns the ref map and rebuilds it whenever a
/// snapshot is taken.
#[derive(Default)]
pub struct PageIndex {
    map: RefMap,
}

impl PageIndex {
    /// Tags the page and rebuilds the ref map. Old refs become invalid.
    pub async fn snapshot(&mut self, page: &Page) -> anyhow::Result<SnapshotReport> {
        let title = page.get_title().await?.unwrap_or_default();
        let url = page.url().await?.unwrap_or_default();
        let elements: Vec<TaggedElement> = page
            .evaluate(TAGGING_SCRIPT)
            .await?
            .into_value()
            .unwrap_or_default();
        let body_text: String = page
            .evaluate("(() => (document.body ? document.body.innerText : '').substring(0, 4000))()")
            .await?
            .into_value()
            .unwrap_or_default();
        debug!(count = elements.len(), url = %url, "page snapshot rebuilt");
        self.map.rebuild(&elements);
        Ok(SnapshotReport {
            title,
            url,
            elements,
            body_text,
        })
    }

    /// Resolves a model-supplied ref to a CSS selector for the tagged
    /// element. Fails for refs from an earlier snapshot.
    pub fn selector(&self, ref_id: &str) -> Result<&str, RefError> {
        self.map.selector(ref_id)
    }

    pub fn element_count(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(ref_id: &str, role: &str, name: &str) -> TaggedElement {
        TaggedElement {
            ref_id: ref_id.into(),
            role: role.into(),
            name: name.into(),
        }
    }

    #[test]
    fn rebuild_replaces_all_refs() {
        let mut map = RefMap::default();
        map.rebuild(&[el("1", "button", "Apply"), el("2", "textbox", "Name")]);
        assert_eq!(map.selector("1").unwrap(), "[data-agent-ref=\"1\"]");
        assert_eq!(map.selector("2").unwrap(), "[data-agent-ref=\"2\"]");

        // New snapshot with fewer elements: ref "2" must go stale.
        map.rebuild(&[el("1", "button", "Submit")]);
        assert_eq!(map.len(), 1);
        assert!(map.selector("2").is_err());
    }

    #[test]
    fn stale_ref_error_mentions_resync() {
        let map = RefMap::default();
        let err = map.selector("7").unwrap_err();
        assert!(err.to_string().contains("get_page_state"));
    }

    #[test]
    fn page_state_text_lists_elements_in_order() {
        let report = SnapshotReport {
            title: "Jobs".into(),
            url: "https://example.com/apply".into(),
            elements: vec![el("1", "textbox", "Full name"), el("2", "button", "Submit")],
            body_text: "Apply now".into(),
        };
        let text = report.page_state_text();
        assert!(text.starts_with("--- PAGE STATE ---"));
        assert!(text.contains("Title: Jobs"));
        let first = text.find("[ref=\"1\"]").unwrap();
        let second = text.find("[ref=\"2\"]").unwrap();
        assert!(first < second);
        assert!(text.contains("- button \"Submit\" [ref=\"2\"]"));
        assert!(text.contains("--- GUIDANCE ---"));
    }
}

//! Page-side snippets evaluated through the extension bridge
//!
//! Every snippet installs a small helper object on `window` the first time it
//! runs and then calls into it. Arguments are embedded as JSON literals so no
//! value coming from the host can break out of its string.

use serde::Serialize;

use crate::host::PanelId;

/// Attribute used to tag panel elements with a stable handle.
pub const PANEL_ATTRIBUTE: &str = "data-quickdup-panel";

const PRELUDE: &str = r#"
(function () {
  if (window.__quickdup) return;
  const PANEL_ATTR = 'data-quickdup-panel';
  let nextPanel = 0;
  const observers = {};
  const api = {
    panel(id) {
      return document.querySelector('[' + PANEL_ATTR + '="' + CSS.escape(id) + '"]');
    },
    root(scope) {
      if (scope === null) return document;
      return api.panel(scope);
    },
    first(css, scope) {
      const root = api.root(scope);
      return root ? root.querySelector(css) : null;
    },
    tag(el) {
      let id = el.getAttribute(PANEL_ATTR);
      if (!id) {
        nextPanel += 1;
        id = 'p' + Date.now().toString(36) + '-' + nextPanel;
        el.setAttribute(PANEL_ATTR, id);
      }
      return id;
    },
    click(el) {
      const opts = { bubbles: true, cancelable: true, view: window };
      el.dispatchEvent(new MouseEvent('mousedown', opts));
      el.dispatchEvent(new MouseEvent('mouseup', opts));
      el.dispatchEvent(new MouseEvent('click', opts));
    },
    observe(id, subscription) {
      const el = api.panel(id);
      if (!el) return false;
      const observer = new MutationObserver(function () {
        window.postMessage({ source: 'quickdup', type: 'mutation', subscription: subscription }, '*');
      });
      observer.observe(el, { childList: true, subtree: true });
      observers[subscription] = observer;
      return true;
    },
    unobserve(subscription) {
      const observer = observers[subscription];
      if (!observer) return false;
      observer.disconnect();
      delete observers[subscription];
      return true;
    },
  };
  window.__quickdup = api;
})();
"#;

fn literal<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn wrap(body: &str) -> String {
    format!("{PRELUDE}\n(function (q) {{\n{body}\n}})(window.__quickdup)")
}

fn scope_literal(scope: Option<&PanelId>) -> String {
    literal(&scope.map(|p| p.0.as_str()))
}

pub fn exists(css: &str, scope: Option<&PanelId>) -> String {
    wrap(&format!(
        "return q.first({}, {}) !== null;",
        literal(css),
        scope_literal(scope)
    ))
}

pub fn attribute(css: &str, name: &str, scope: Option<&PanelId>) -> String {
    wrap(&format!(
        "const el = q.first({}, {}); return el ? el.getAttribute({}) : null;",
        literal(css),
        scope_literal(scope),
        literal(name)
    ))
}

pub fn click(css: &str, scope: Option<&PanelId>) -> String {
    wrap(&format!(
        "const el = q.first({}, {}); if (!el) return false; q.click(el); return true;",
        literal(css),
        scope_literal(scope)
    ))
}

pub fn panels(css: &str) -> String {
    wrap(&format!(
        "return Array.from(document.querySelectorAll({})).map(q.tag);",
        literal(css)
    ))
}

pub fn is_attached(panel: &PanelId) -> String {
    wrap(&format!(
        "const el = q.panel({}); return !!el && el.isConnected;",
        literal(&panel.0)
    ))
}

/// Returns objects shaped like [`crate::host::ControlInfo`].
pub fn labeled_controls(panel: &PanelId, css: &str, spacer_class: &str, custom_class: &str) -> String {
    wrap(&format!(
        r#"const root = q.panel({panel});
if (!root) return [];
const spacer = {spacer};
const custom = {custom};
return Array.from(root.querySelectorAll({css})).map(function (el) {{
  const prev = el.previousElementSibling;
  return {{
    class_name: el.className || '',
    aria_label: el.getAttribute('aria-label'),
    preceded_by_spacer: !!prev && prev.classList.contains(spacer),
    inside_custom: !!el.closest('.' + CSS.escape(custom)),
  }};
}});"#,
        panel = literal(&panel.0),
        spacer = literal(spacer_class),
        custom = literal(custom_class),
        css = literal(css),
    ))
}

pub fn prepend(panel: &PanelId, markup: &str) -> String {
    wrap(&format!(
        r#"const root = q.panel({});
if (!root) return false;
const holder = document.createElement('div');
holder.innerHTML = {};
const nodes = Array.from(holder.childNodes);
for (let i = nodes.length - 1; i >= 0; i--) root.insertBefore(nodes[i], root.firstChild);
return true;"#,
        literal(&panel.0),
        literal(markup)
    ))
}

pub fn remove_all(css: &str) -> String {
    wrap(&format!(
        "const els = Array.from(document.querySelectorAll({})); els.forEach(function (el) {{ el.remove(); }}); return els.length;",
        literal(css)
    ))
}

pub fn location() -> String {
    wrap("return window.location.href;")
}

pub fn language() -> String {
    wrap("return navigator.language || document.documentElement.lang || null;")
}

pub fn navigate(url: &str, replace: bool) -> String {
    let call = if replace { "replace" } else { "assign" };
    wrap(&format!("window.location.{call}({}); return true;", literal(url)))
}

pub fn scroll_offsets(css: &str) -> String {
    wrap(&format!(
        "const el = document.querySelector({}); return el ? {{ top: el.scrollTop, left: el.scrollLeft }} : null;",
        literal(css)
    ))
}

pub fn set_scroll_offsets(css: &str, top: f64, left: f64) -> String {
    wrap(&format!(
        "const el = document.querySelector({}); if (!el) return false; el.scrollTop = {}; el.scrollLeft = {}; return true;",
        literal(css),
        literal(&top),
        literal(&left)
    ))
}

pub fn set_body_class(class: &str, present: bool) -> String {
    wrap(&format!(
        "if (document.body) document.body.classList.toggle({}, {}); return true;",
        literal(class),
        present
    ))
}

pub fn observe(panel: &PanelId, subscription: &str) -> String {
    wrap(&format!(
        "return q.observe({}, {});",
        literal(&panel.0),
        literal(subscription)
    ))
}

pub fn unobserve(subscription: &str) -> String {
    wrap(&format!("return q.unobserve({});", literal(subscription)))
}

pub fn next_frame() -> String {
    wrap("return new Promise(function (resolve) { requestAnimationFrame(function () { resolve(true); }); });")
}

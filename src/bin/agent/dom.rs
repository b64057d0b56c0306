use anyhow::{Context, Result};
use headless_chrome::Tab;
use screen_guide::screen::{NodePath, ScreenTree};

/// JavaScript injected into the page to copy the visible DOM into a `ScreenNode` tree.
///
/// Every emitted element gets a `data-sg-path` attribute holding its node path, so
/// later actions can find it again without re-walking. Paths from an older capture
/// are cleared first.
const TREE_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK','META','TEMPLATE']);
  document.querySelectorAll('[data-sg-path]').forEach(el => el.removeAttribute('data-sg-path'));

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && getComputedStyle(el).position !== 'fixed') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function ownText(el) {
    let t = '';
    for (const n of el.childNodes) {
      if (n.nodeType === Node.TEXT_NODE) t += n.textContent;
    }
    t = t.replace(/\s+/g, ' ').trim();
    if (!t && (el.tagName === 'BUTTON' || el.tagName === 'A')) t = (el.innerText || '').trim();
    return t ? t.slice(0, 200) : null;
  }

  function scrollable(el, s) {
    const y = /(auto|scroll)/.test(s.overflowY) && el.scrollHeight > el.clientHeight + 4;
    const x = /(auto|scroll)/.test(s.overflowX) && el.scrollWidth > el.clientWidth + 4;
    return x || y;
  }

  function build(el, path, depth) {
    el.setAttribute('data-sg-path', path || '/');
    const tag = el.tagName.toLowerCase();
    const s = getComputedStyle(el);
    const r = el.getBoundingClientRect();
    const editable = tag === 'input' || tag === 'textarea' || el.isContentEditable;
    const role = el.getAttribute('role');
    const node = {
      text: editable ? (el.value || null) : ownText(el),
      description: el.getAttribute('aria-label') || el.getAttribute('title')
        || el.getAttribute('alt') || el.getAttribute('placeholder') || null,
      view_id: el.id || null,
      class_name: role === 'list' || tag === 'ul' || tag === 'ol' ? 'list' : tag,
      bounds: {
        left: Math.round(r.left), top: Math.round(r.top),
        right: Math.round(r.right), bottom: Math.round(r.bottom)
      },
      visible: true,
      clickable: ['a','button','select','summary','label'].includes(tag)
        || role === 'button' || role === 'link' || typeof el.onclick === 'function',
      scrollable: scrollable(el, s),
      editable: editable,
      focused: document.activeElement === el,
      children: []
    };
    if (depth < 40) {
      let i = 0;
      for (const child of el.children) {
        if (SKIP.has(child.tagName) || !isVisible(child)) continue;
        node.children.push(build(child, path + '/' + i, depth + 1));
        i++;
      }
    }
    return node;
  }

  const root = build(document.body, '', 0);
  const page = document.scrollingElement;
  if (page && page.scrollHeight > window.innerHeight + 4) {
    root.scrollable = true;
    root.class_name = 'scrollview';
  }
  return JSON.stringify({ package: location.host || location.protocol.replace(':', ''), root });
})()
"#;

/// Copies the visible page. `None` when the page has no body yet.
pub fn capture_tree(tab: &Tab) -> Result<Option<ScreenTree>> {
    let value = tab
        .evaluate(TREE_JS, false)
        .context("tree capture script failed")?
        .value;
    let Some(json) = value.as_ref().and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let tree = serde_json::from_str(json).context("tree capture returned malformed JSON")?;
    Ok(Some(tree))
}

/// Runs `body` with `el` bound to the element at `path`. Returns false if it is gone.
fn with_element(tab: &Tab, path: &NodePath, body: &str) -> Result<bool> {
    let js = format!(
        "(() => {{ const el = document.querySelector('[data-sg-path=\"{path}\"]'); \
         if (!el) return false; {body} return true; }})()"
    );
    let value = tab.evaluate(&js, false)?.value;
    Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
}

pub fn click(tab: &Tab, path: &NodePath) -> Result<bool> {
    with_element(tab, path, "el.scrollIntoView({block: 'center'}); el.click();")
}

pub fn scroll(tab: &Tab, path: &NodePath, forward: bool) -> Result<bool> {
    let sign = if forward { 1 } else { -1 };
    with_element(
        tab,
        path,
        &format!(
            "const target = el === document.body ? window : el; \
             const h = el === document.body ? window.innerHeight : el.clientHeight; \
             target.scrollBy({{top: {sign} * h * 0.8, behavior: 'smooth'}});"
        ),
    )
}

pub fn set_text(tab: &Tab, path: &NodePath, text: &str) -> Result<bool> {
    let literal = serde_json::to_string(text)?;
    with_element(
        tab,
        path,
        &format!(
            "el.focus(); \
             if (el.isContentEditable) {{ el.textContent = {literal}; }} else {{ el.value = {literal}; }} \
             el.dispatchEvent(new Event('input', {{bubbles: true}})); \
             el.dispatchEvent(new Event('change', {{bubbles: true}}));"
        ),
    )
}

/// Installs a MutationObserver that counts DOM changes into `window.__sgMutations`.
pub fn install_mutation_counter(tab: &Tab) -> Result<()> {
    tab.evaluate(
        r#"(() => {
  if (window.__sgObserver) return;
  window.__sgMutations = 0;
  window.__sgObserver = new MutationObserver(() => { window.__sgMutations++; });
  window.__sgObserver.observe(document, {subtree: true, childList: true, characterData: true, attributes: true, attributeFilter: ['class', 'style', 'hidden']});
})()"#,
        false,
    )?;
    Ok(())
}

/// Mutation count since the counter was installed; `None` after a navigation wiped it.
pub fn mutation_count(tab: &Tab) -> Result<Option<u64>> {
    let value = tab
        .evaluate("typeof window.__sgMutations === 'number' ? window.__sgMutations : null", false)?
        .value;
    Ok(value.and_then(|v| v.as_u64()))
}

pub fn get_current_url(tab: &Tab) -> Result<String> {
    let value = tab.evaluate("window.location.href", false)?.value;
    Ok(value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

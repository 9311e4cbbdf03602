//! Browser-facing pieces of the authorization callback

use serde::Deserialize;

/// Query parameters of `GET /callback`
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State echoed by the authorization server
    pub state: Option<String>,

    /// Error code reported by the authorization server
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

const PAGE_STYLE: &str = "body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,sans-serif;\
display:flex;justify-content:center;align-items:center;height:100vh;margin:0}\
.box{text-align:center;padding:2rem;border-radius:16px;max-width:420px}\
.code{font-family:monospace;margin-top:1rem;opacity:.7}";

/// Page shown after a successful callback
#[must_use]
pub fn success_page(backend: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>Authorization Successful</title>\
         <style>{PAGE_STYLE}</style></head><body><div class=\"box\">\
         <h1>Authorization Successful</h1>\
         <p>Backend <b>{}</b> is connected. You can close this window.</p>\
         </div></body></html>",
        escape_html(backend)
    )
}

/// Page shown when the callback is rejected
#[must_use]
pub fn error_page(error: &str, description: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>Authorization Failed</title>\
         <style>{PAGE_STYLE}</style></head><body><div class=\"box\">\
         <h1>Authorization Failed</h1><p>{}</p><p class=\"code\">Error: {}</p>\
         </div></body></html>",
        escape_html(description),
        escape_html(error)
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_params_deserialize() {
        let params: CallbackParams = serde_urlencoded::from_str("code=abc123&state=xyz789").unwrap();
        assert_eq!(params.code.as_deref(), Some("abc123"));
        assert_eq!(params.state.as_deref(), Some("xyz789"));
        assert!(params.error.is_none());
    }

    #[test]
    fn error_page_escapes_input() {
        let page = error_page("access_denied", "<script>alert(1)</script>");
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;"));
    }
}
